//! Host key pinning. Every connection attempt asks this store whether the
//! presented key is trusted before authentication starts.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Result, TransferError};
use crate::prompt::{HostKeyPrompt, Prompter};

/// Decision hook invoked by connectors during the handshake.
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, host: &str, port: u16, algorithm: &str, fingerprint: &str) -> bool;
}

/// Trusts every key. Only for tests and loopback fixtures.
pub struct AcceptAll;

impl HostKeyVerifier for AcceptAll {
    fn verify(&self, _host: &str, _port: u16, _algorithm: &str, _fingerprint: &str) -> bool {
        true
    }
}

/// `SHA256:<base64 without padding>` over the raw public key blob.
pub fn fingerprint_sha256(key: &[u8]) -> String {
    let hash = Sha256::digest(key);
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustedHostKey {
    pub host: String,
    pub port: u16,
    pub algorithm: String,
    pub fingerprint: String,
    /// RFC 3339.
    pub trusted_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    Trusted,
    Unknown,
    Changed { stored: String },
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS host_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    algorithm TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    trusted_at TEXT NOT NULL,
    UNIQUE(host, port, algorithm)
)";

fn db_err(e: rusqlite::Error) -> TransferError {
    TransferError::Local(format!("trust store: {e}"))
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(SCHEMA, [])?;
    conn.query_row("SELECT COUNT(*) FROM host_keys", [], |r| r.get::<_, i64>(0))?;
    Ok(())
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_start_matches('[').trim_end_matches(']').to_lowercase()
}

/// SQLite-backed trust pins keyed by (host, port, algorithm).
pub struct KnownHostsStore {
    conn: Mutex<Connection>,
    prompter: Arc<dyn Prompter>,
    path: Option<PathBuf>,
}

impl KnownHostsStore {
    /// Open (or create) the store at `path`. A file that is not a readable
    /// trust store is moved aside and replaced by an empty one.
    pub fn open(path: &Path, prompter: Arc<dyn Prompter>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TransferError::from_local_io(&e, &parent.display().to_string()))?;
        }
        let conn = match Connection::open(path).and_then(|c| init_schema(&c).map(|_| c)) {
            Ok(c) => c,
            Err(e) => {
                let aside = path.with_extension(format!(
                    "corrupt-{}",
                    chrono::Utc::now().format("%Y%m%dT%H%M%SZ")
                ));
                warn!("[trust] store unreadable, rebuilding path={} err={}", path.display(), e);
                std::fs::rename(path, &aside)
                    .map_err(|e| TransferError::from_local_io(&e, &path.display().to_string()))?;
                let c = Connection::open(path).map_err(db_err)?;
                init_schema(&c).map_err(db_err)?;
                c
            }
        };
        debug!("[trust] opened path={}", path.display());
        Ok(Self { conn: Mutex::new(conn), prompter, path: Some(path.to_path_buf()) })
    }

    pub fn open_in_memory(prompter: Arc<dyn Prompter>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        init_schema(&conn).map_err(db_err)?;
        Ok(Self { conn: Mutex::new(conn), prompter, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn db(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn lookup(&self, host: &str, port: u16, algorithm: &str) -> Result<Option<TrustedHostKey>> {
        self.db()
            .query_row(
                "SELECT host, port, algorithm, fingerprint, trusted_at FROM host_keys
                 WHERE host = ?1 AND port = ?2 AND algorithm = ?3",
                params![normalize_host(host), port as i64, algorithm],
                |row| {
                    Ok(TrustedHostKey {
                        host: row.get(0)?,
                        port: row.get::<_, i64>(1)? as u16,
                        algorithm: row.get(2)?,
                        fingerprint: row.get(3)?,
                        trusted_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)
    }

    /// Classify a presented key without prompting.
    pub fn check(
        &self,
        host: &str,
        port: u16,
        algorithm: &str,
        fingerprint: &str,
    ) -> Result<HostKeyStatus> {
        Ok(match self.lookup(host, port, algorithm)? {
            None => HostKeyStatus::Unknown,
            Some(e) if e.fingerprint == fingerprint => HostKeyStatus::Trusted,
            Some(e) => HostKeyStatus::Changed { stored: e.fingerprint },
        })
    }

    /// Insert or replace the pin for (host, port, algorithm).
    pub fn trust(&self, host: &str, port: u16, algorithm: &str, fingerprint: &str) -> Result<()> {
        self.db()
            .execute(
                "INSERT INTO host_keys (host, port, algorithm, fingerprint, trusted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(host, port, algorithm)
                 DO UPDATE SET fingerprint = excluded.fingerprint, trusted_at = excluded.trusted_at",
                params![
                    normalize_host(host),
                    port as i64,
                    algorithm,
                    fingerprint,
                    chrono::Utc::now().to_rfc3339()
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Full trust decision, prompting through the collaborator when the host
    /// is new or its key changed. Refusals and store failures are untrusted.
    pub fn is_trusted(&self, host: &str, port: u16, algorithm: &str, fingerprint: &str) -> bool {
        let status = match self.check(host, port, algorithm, fingerprint) {
            Ok(s) => s,
            Err(e) => {
                warn!("[trust] lookup failed host={} err={}", host, e);
                return false;
            }
        };
        let prompt = match &status {
            HostKeyStatus::Trusted => {
                debug!("[trust] pinned key matches host={} port={}", host, port);
                return true;
            }
            HostKeyStatus::Unknown => HostKeyPrompt {
                title: "Unknown host".to_string(),
                message: format!(
                    "The authenticity of host '{}:{}' can't be established.",
                    host, port
                ),
                details: format!("{} key fingerprint is {}", algorithm, fingerprint),
                is_warning: false,
            },
            HostKeyStatus::Changed { stored } => HostKeyPrompt {
                title: "WARNING: HOST KEY HAS CHANGED".to_string(),
                message: format!(
                    "The {} host key for '{}:{}' differs from the pinned one. \
                     Someone could be intercepting this connection.",
                    algorithm, host, port
                ),
                details: format!("stored:    {}\npresented: {}", stored, fingerprint),
                is_warning: true,
            },
        };
        // 同线程弹窗会死锁
        if self.prompter.owner_thread() == Some(std::thread::current().id()) {
            warn!("[trust] refusing prompt on the prompter's own thread host={}", host);
            return false;
        }
        if !self.prompter.confirm_host_key(&prompt) {
            info!("[trust] key refused host={} port={} algorithm={}", host, port, algorithm);
            return false;
        }
        match self.trust(host, port, algorithm, fingerprint) {
            Ok(()) => {
                info!(
                    "[trust] pinned host={} port={} algorithm={} replaced={}",
                    host,
                    port,
                    algorithm,
                    prompt.is_warning
                );
                true
            }
            Err(e) => {
                warn!("[trust] could not persist pin host={} err={}", host, e);
                false
            }
        }
    }

    pub fn entries(&self) -> Result<Vec<TrustedHostKey>> {
        let db = self.db();
        let mut stmt = db
            .prepare(
                "SELECT host, port, algorithm, fingerprint, trusted_at FROM host_keys
                 ORDER BY host, port, algorithm",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TrustedHostKey {
                    host: row.get(0)?,
                    port: row.get::<_, i64>(1)? as u16,
                    algorithm: row.get(2)?,
                    fingerprint: row.get(3)?,
                    trusted_at: row.get(4)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Forget pins for a host; every algorithm when `algorithm` is `None`.
    pub fn remove(&self, host: &str, port: u16, algorithm: Option<&str>) -> Result<usize> {
        let db = self.db();
        let n = match algorithm {
            Some(a) => db.execute(
                "DELETE FROM host_keys WHERE host = ?1 AND port = ?2 AND algorithm = ?3",
                params![normalize_host(host), port as i64, a],
            ),
            None => db.execute(
                "DELETE FROM host_keys WHERE host = ?1 AND port = ?2",
                params![normalize_host(host), port as i64],
            ),
        }
        .map_err(db_err)?;
        Ok(n)
    }

    pub fn clear(&self) -> Result<usize> {
        self.db().execute("DELETE FROM host_keys", []).map_err(db_err)
    }
}

impl HostKeyVerifier for KnownHostsStore {
    fn verify(&self, host: &str, port: u16, algorithm: &str, fingerprint: &str) -> bool {
        self.is_trusted(host, port, algorithm, fingerprint)
    }
}
