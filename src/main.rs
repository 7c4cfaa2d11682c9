use clap::Parser;

use skiff::cli::{Cli, Commands};
use skiff::commands::{handle_hosts, handle_transfer};
use skiff::config::Config;
use skiff::queue::{DeleteRequest, DownloadRequest, JobDefinition, JobWork, UploadRequest};
use skiff::{logging, util};

fn title_for(verb: &str, first: &str, count: usize) -> String {
    if count > 1 {
        format!("{} {} (+{})", verb, first, count - 1)
    } else {
        format!("{} {}", verb, first)
    }
}

fn run(cli: Cli, config: &Config) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Put { conn, transfer, sources, remote_dir } => {
            let first = sources
                .first()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let title = title_for("put", &first, sources.len());
            let work = JobWork::Upload(UploadRequest { sources, remote_dir });
            handle_transfer(config, &conn, transfer, JobDefinition::new(title, work))
        }
        Commands::Get { conn, transfer, sources, local_dir } => {
            let first = sources.first().cloned().unwrap_or_default();
            let title = title_for("get", &first, sources.len());
            let work = JobWork::Download(DownloadRequest { sources, local_dir });
            handle_transfer(config, &conn, transfer, JobDefinition::new(title, work))
        }
        Commands::Rm { conn, paths } => {
            let first = paths.first().cloned().unwrap_or_default();
            let title = title_for("rm", &first, paths.len());
            let work = JobWork::Delete(DeleteRequest { paths });
            handle_transfer(config, &conn, Default::default(), JobDefinition::new(title, work))
        }
        Commands::Hosts { action } => {
            handle_hosts(config, action)?;
            Ok(0)
        }
    }
}

fn main() {
    util::try_enable_ansi_on_windows();
    let cli = Cli::parse();
    let config = match Config::init() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ 配置加载失败: {:#}", e);
            std::process::exit(2);
        }
    };
    let guard = logging::init_logging(cli.verbose, &config.log_dir);

    let code = match run(cli, &config) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("❌ {:#}", e);
            1
        }
    };
    // flush the file writer before exit skips destructors
    drop(guard);
    std::process::exit(code);
}
