//! Tracing setup for the binary.
//!
//! Warnings and errors always go to stderr. `--verbose` adds a debug-level
//! daily log file under the config directory; the returned guard flushes it
//! and must live until the process exits.
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_logging(verbose: bool, log_dir: &Path) -> Option<WorkerGuard> {
    // RUST_LOG overrides the stderr level
    let stderr_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    if !verbose {
        let _ = tracing_subscriber::registry().with(stderr_layer).try_init();
        return None;
    }

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("⚠️ 无法创建日志目录 {}: {}", log_dir.display(), e);
        let _ = tracing_subscriber::registry().with(stderr_layer).try_init();
        return None;
    }
    let appender = tracing_appender::rolling::daily(log_dir, "skiff.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_names(true)
        .with_filter(EnvFilter::new("skiff=debug"));
    let _ = tracing_subscriber::registry().with(stderr_layer).with(file_layer).try_init();
    Some(guard)
}
