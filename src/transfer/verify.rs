//! Post-transfer integrity checks.
//!
//! Sizes are always compared. Files up to the hash threshold are hashed with
//! SHA-256 on both ends; larger files fall back to an mtime proximity check.
//! Any mismatch removes the destination copy.
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{TransferItem, TransferOptions};
use crate::connection::ConnectionManager;
use crate::error::{Result, TransferError};
use crate::path::display_path;
use crate::transfer::cancel::CancelToken;
use crate::util::system_time_secs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerificationMode {
    Hashed,
    Timestamp,
    /// Sizes matched but neither a hash nor both mtimes were available.
    SizeOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerificationSummary {
    pub hashed: usize,
    pub timestamp: usize,
    pub size_only: usize,
}

impl VerificationSummary {
    pub fn record(&mut self, mode: VerificationMode) {
        match mode {
            VerificationMode::Hashed => self.hashed += 1,
            VerificationMode::Timestamp => self.timestamp += 1,
            VerificationMode::SizeOnly => self.size_only += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.hashed + self.timestamp + self.size_only
    }

    pub fn status_line(&self) -> String {
        let mut s = format!(
            "verified {} files ({} hashed, {} timestamp",
            self.total(),
            self.hashed,
            self.timestamp
        );
        if self.size_only > 0 {
            s.push_str(&format!(", {} size only", self.size_only));
        }
        s.push(')');
        s
    }
}

/// Stream `reader` through SHA-256, checking `cancel` between buffers.
pub fn sha256_stream(reader: &mut dyn Read, cancel: &CancelToken, ctx: &str) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        cancel.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::from_io(&e, ctx)),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_local(path: &Path, cancel: &CancelToken) -> Result<String> {
    let ctx = display_path(path).to_string();
    let mut f =
        std::fs::File::open(path).map_err(|e| TransferError::from_local_io(&e, &ctx))?;
    sha256_stream(&mut f, cancel, &ctx)
}

pub fn sha256_remote(conn: &ConnectionManager, path: &str, cancel: &CancelToken) -> Result<String> {
    conn.execute_with_reconnect_retry("hash", cancel, |fs| {
        let mut r = fs.open_read(path, 0)?;
        sha256_stream(&mut r, cancel, path)
    })
}

fn within(a: u64, b: u64, tolerance: u64) -> bool {
    a.abs_diff(b) <= tolerance
}

fn discard_remote(conn: &ConnectionManager, path: &str) {
    // 校验失败: 删除损坏的目标
    if let Err(e) = conn.remove_file(path, &CancelToken::new()) {
        warn!("[exec] failed to remove corrupt destination path={} err={}", path, e);
    }
}

fn discard_local(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("[exec] failed to remove corrupt destination path={} err={}", display_path(path), e);
    }
}

/// Check an uploaded file at `item.remote` against the local source.
pub fn verify_upload(
    conn: &ConnectionManager,
    item: &TransferItem,
    options: &TransferOptions,
    cancel: &CancelToken,
) -> Result<VerificationMode> {
    let dest = conn.stat(&item.remote, cancel)?;
    if dest.size != item.size {
        discard_remote(conn, &item.remote);
        return Err(TransferError::SizeMismatch {
            path: item.remote.clone(),
            expected: item.size,
            actual: dest.size,
        });
    }
    if item.size <= options.hash_threshold_bytes {
        let source_hash = sha256_local(&item.local, cancel)?;
        let dest_hash = sha256_remote(conn, &item.remote, cancel)?;
        if source_hash != dest_hash {
            discard_remote(conn, &item.remote);
            return Err(TransferError::HashMismatch {
                path: item.remote.clone(),
                source_hash,
                dest_hash,
            });
        }
        debug!("[exec] verified path={} mode=hashed", item.remote);
        return Ok(VerificationMode::Hashed);
    }
    match (item.mtime, dest.mtime) {
        (Some(src), Some(dst)) if !within(src, dst, options.mtime_tolerance_secs) => {
            discard_remote(conn, &item.remote);
            Err(TransferError::TimestampMismatch {
                path: item.remote.clone(),
                source_mtime: src,
                dest_mtime: dst,
            })
        }
        (Some(_), Some(_)) => {
            debug!("[exec] verified path={} mode=timestamp", item.remote);
            Ok(VerificationMode::Timestamp)
        }
        _ => Ok(VerificationMode::SizeOnly),
    }
}

/// Check a downloaded file at `item.local` against the remote source.
pub fn verify_download(
    conn: &ConnectionManager,
    item: &TransferItem,
    options: &TransferOptions,
    cancel: &CancelToken,
) -> Result<VerificationMode> {
    let ctx = display_path(&item.local).to_string();
    let md = std::fs::metadata(&item.local).map_err(|e| TransferError::from_local_io(&e, &ctx))?;
    if md.len() != item.size {
        discard_local(&item.local);
        return Err(TransferError::SizeMismatch { path: ctx, expected: item.size, actual: md.len() });
    }
    if item.size <= options.hash_threshold_bytes {
        let source_hash = sha256_remote(conn, &item.remote, cancel)?;
        let dest_hash = sha256_local(&item.local, cancel)?;
        if source_hash != dest_hash {
            discard_local(&item.local);
            return Err(TransferError::HashMismatch { path: ctx, source_hash, dest_hash });
        }
        debug!("[exec] verified path={} mode=hashed", ctx);
        return Ok(VerificationMode::Hashed);
    }
    let local_mtime = md.modified().ok().and_then(system_time_secs);
    match (item.mtime, local_mtime) {
        (Some(src), Some(dst)) if !within(src, dst, options.mtime_tolerance_secs) => {
            discard_local(&item.local);
            Err(TransferError::TimestampMismatch { path: ctx, source_mtime: src, dest_mtime: dst })
        }
        (Some(_), Some(_)) => {
            debug!("[exec] verified path={} mode=timestamp", ctx);
            Ok(VerificationMode::Timestamp)
        }
        _ => Ok(VerificationMode::SizeOnly),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_line_counts_modes() {
        let mut s = VerificationSummary::default();
        s.record(VerificationMode::Hashed);
        s.record(VerificationMode::Hashed);
        s.record(VerificationMode::Timestamp);
        assert_eq!(s.status_line(), "verified 3 files (2 hashed, 1 timestamp)");
        s.record(VerificationMode::SizeOnly);
        assert_eq!(s.status_line(), "verified 4 files (2 hashed, 1 timestamp, 1 size only)");
    }

    #[test]
    fn stream_hash_matches_known_digest() {
        let mut data: &[u8] = b"abc";
        let h = sha256_stream(&mut data, &CancelToken::new(), "mem").unwrap();
        assert_eq!(h, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }

    #[test]
    fn cancelled_hash_stops() {
        let token = CancelToken::new();
        token.cancel();
        let mut data: &[u8] = b"abc";
        assert!(sha256_stream(&mut data, &token, "mem").unwrap_err().is_cancelled());
    }

    #[test]
    fn mtime_tolerance_is_inclusive() {
        assert!(within(100, 102, 2));
        assert!(!within(100, 103, 2));
    }
}
