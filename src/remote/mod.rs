//! Remote filesystem capability interface consumed by the connection manager,
//! planner and executor, plus its backends.
use std::io::{Read, Write};
use std::sync::Arc;

use crate::auth::AuthCredential;
use crate::error::{Result, TransferError};
use crate::known_hosts::HostKeyVerifier;
use crate::profile::{ConnectionProfile, ResiliencePolicy};

pub mod memory;
pub mod sftp;

/// Attributes reported by `stat`/`lstat`. Absent fields were not sent by the
/// server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub mtime: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub perm: Option<u32>,
}

impl RemoteStat {
    pub fn is_file(&self) -> bool {
        !self.is_dir && !self.is_symlink
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    /// `lstat` view: symlinks are reported as links, not as their target.
    pub stat: RemoteStat,
}

/// Attribute changes for `set_stat`; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetStat {
    pub perm: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime: Option<u64>,
}

/// One authenticated remote session. All paths are absolute and normalized
/// by the caller.
pub trait RemoteFs: Send + Sync {
    fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>>;
    /// Follows symlinks.
    fn stat(&self, path: &str) -> Result<RemoteStat>;
    fn lstat(&self, path: &str) -> Result<RemoteStat>;

    fn exists(&self, path: &str) -> Result<bool> {
        match self.lstat(path) {
            Ok(_) => Ok(true),
            Err(TransferError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn Read + Send>>;
    /// Offset 0 creates or truncates; a positive offset continues an existing
    /// file at that byte.
    fn open_write(&self, path: &str, offset: u64) -> Result<Box<dyn Write + Send>>;

    /// Plain rename; fails when `to` exists.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn supports_atomic_overwrite_rename(&self) -> bool {
        false
    }

    /// Rename replacing `to` in a single step. Only valid when
    /// [`RemoteFs::supports_atomic_overwrite_rename`] is true.
    fn rename_overwrite(&self, _from: &str, _to: &str) -> Result<()> {
        Err(TransferError::Unsupported("atomic overwrite rename".into()))
    }

    fn remove_file(&self, path: &str) -> Result<()>;
    /// Non-recursive.
    fn remove_dir(&self, path: &str) -> Result<()>;
    fn create_dir(&self, path: &str) -> Result<()>;
    fn symlink(&self, target: &str, link: &str) -> Result<()>;
    fn read_link(&self, path: &str) -> Result<String>;
    fn run_command(&self, command: &str) -> Result<String>;
    fn set_stat(&self, path: &str, attrs: &SetStat) -> Result<()>;

    fn is_connected(&self) -> bool;
    /// Force-close the transport so blocked reads and writes return promptly.
    fn interrupt(&self);
    fn close(&self) -> Result<()>;
}

/// Everything a connector needs to open one authenticated session.
pub struct ConnectRequest<'a> {
    pub profile: &'a ConnectionProfile,
    pub policy: &'a ResiliencePolicy,
    pub methods: &'a [AuthCredential],
    pub host_keys: &'a dyn HostKeyVerifier,
}

pub trait Connector: Send + Sync {
    fn open(&self, request: &ConnectRequest<'_>) -> Result<Arc<dyn RemoteFs>>;
}
