use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::parse::{parse_auth_order, parse_remote_host};
use crate::profile::{ConnectionProfile, ReconnectStrategy};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(short, long, global = true, help = "Write a debug log file under ~/.skiff/logs")]
    pub verbose: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    #[clap(long = "host", help = "Remote server as user@host[:port]")]
    pub host: String,
    #[clap(short = 'p', long = "port", help = "Port, overrides the one in --host")]
    pub port: Option<u16>,
    #[clap(short = 'i', long = "identity", help = "Private key file (default: ~/.ssh/id_ed25519, id_rsa, id_ecdsa)")]
    pub identity: Option<String>,
    #[clap(long = "password-env", help = "Read the password from this environment variable")]
    pub password_env: Option<String>,
    #[clap(long = "auth-order", help = "Comma separated preference, e.g. key,agent,password")]
    pub auth_order: Option<String>,
    #[clap(long = "timeout", default_value_t = 30, help = "Connect/operation timeout in seconds")]
    pub timeout: u64,
    #[clap(long = "keepalive", default_value_t = 30, help = "Keepalive interval in seconds (0 disables)")]
    pub keepalive: u64,
    #[clap(long = "reconnect-attempts", default_value_t = 3)]
    pub reconnect_attempts: u32,
    #[clap(long = "reconnect-delay", default_value_t = 2, help = "Seconds between reconnect attempts")]
    pub reconnect_delay: u64,
    #[clap(long = "no-reconnect", help = "Fail instead of reconnecting when the session drops")]
    pub no_reconnect: bool,
}

#[derive(Args, Debug, Clone, Copy, Default)]
pub struct TransferFlags {
    #[clap(long = "no-verify", help = "Skip post-transfer integrity checks")]
    pub no_verify: bool,
    #[clap(long = "no-resume", help = "Always restart partial files from zero")]
    pub no_resume: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Upload local files or directories into a remote directory", name = "put")]
    Put {
        #[clap(flatten)]
        conn: ConnectArgs,
        #[clap(flatten)]
        transfer: TransferFlags,
        #[clap(num_args = 1.., required = true, help = "Local files or directories")]
        sources: Vec<PathBuf>,
        #[clap(long = "to", required = true, help = "Remote destination directory")]
        remote_dir: String,
    },
    #[clap(about = "Download remote files or directories into a local directory", name = "get")]
    Get {
        #[clap(flatten)]
        conn: ConnectArgs,
        #[clap(flatten)]
        transfer: TransferFlags,
        #[clap(num_args = 1.., required = true, help = "Remote files or directories")]
        sources: Vec<String>,
        #[clap(long = "to", default_value = ".", help = "Local destination directory")]
        local_dir: PathBuf,
    },
    #[clap(about = "Delete remote files or directories", name = "rm")]
    Rm {
        #[clap(flatten)]
        conn: ConnectArgs,
        #[clap(num_args = 1.., required = true)]
        paths: Vec<String>,
    },
    #[clap(about = "Manage pinned host keys", name = "hosts")]
    Hosts {
        #[clap(subcommand)]
        action: HostsCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum HostsCommand {
    #[clap(about = "List pinned host keys", name = "list")]
    List {
        #[clap(long, help = "Print JSON instead of a table")]
        json: bool,
    },
    #[clap(about = "Forget the pinned keys of a host", name = "forget")]
    Forget {
        host: String,
        #[clap(short, long, default_value_t = 22)]
        port: u16,
        #[clap(long, help = "Only this key algorithm, e.g. ssh-ed25519")]
        algorithm: Option<String>,
    },
    #[clap(about = "Forget every pinned host key", name = "clear")]
    Clear {
        #[clap(long, help = "Do not ask for confirmation")]
        yes: bool,
    },
}

fn default_identity() -> Option<String> {
    let ssh_dir = dirs::home_dir()?.join(".ssh");
    ["id_ed25519", "id_rsa", "id_ecdsa"]
        .iter()
        .map(|n| ssh_dir.join(n))
        .find(|p| p.is_file())
        .map(|p| p.to_string_lossy().to_string())
}

impl ConnectArgs {
    pub fn to_profile(&self) -> Result<ConnectionProfile> {
        let (user, host, port) = parse_remote_host(&self.host)?;
        let mut p = ConnectionProfile::new(host, self.port.unwrap_or(port), user);
        if let Some(order) = &self.auth_order {
            p.auth_order = parse_auth_order(order)?;
        }
        p.private_key_path = self.identity.clone().or_else(default_identity);
        if let Some(var) = &self.password_env {
            let secret = std::env::var(var)
                .with_context(|| format!("environment variable {} is not set", var))?;
            p.password = Some(secret);
        }
        p.timeout_secs = self.timeout;
        p.keepalive_secs = self.keepalive;
        p.reconnect_attempts = self.reconnect_attempts;
        p.reconnect_delay_secs = self.reconnect_delay;
        if self.no_reconnect {
            p.reconnect_strategy = ReconnectStrategy::None;
        }
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::AuthMethodKind;

    #[test]
    fn put_parses_into_profile() {
        let cli = Cli::parse_from([
            "skiff", "put", "--host", "deploy@example.com:2222", "-i", "/k/id", "--auth-order",
            "key,password", "--no-reconnect", "a.txt", "dir", "--to", "/srv",
        ]);
        let Commands::Put { conn, transfer, sources, remote_dir } = cli.command else {
            panic!("expected put");
        };
        assert_eq!(sources, vec![PathBuf::from("a.txt"), PathBuf::from("dir")]);
        assert_eq!(remote_dir, "/srv");
        assert!(!transfer.no_verify);
        let p = conn.to_profile().unwrap();
        assert_eq!((p.username.as_str(), p.host.as_str(), p.port), ("deploy", "example.com", 2222));
        assert_eq!(p.auth_order, vec![AuthMethodKind::PrivateKey, AuthMethodKind::Password]);
        assert_eq!(p.private_key_path.as_deref(), Some("/k/id"));
        assert_eq!(p.reconnect_strategy, ReconnectStrategy::None);
    }

    #[test]
    fn missing_password_env_is_an_error() {
        let cli = Cli::parse_from([
            "skiff", "rm", "--host", "u@h", "--password-env", "SKIFF_TEST_SURELY_UNSET_VAR", "/x",
        ]);
        let Commands::Rm { conn, .. } = cli.command else {
            panic!("expected rm");
        };
        assert!(conn.to_profile().is_err());
    }
}
