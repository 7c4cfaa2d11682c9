//! Single-file transfer: resumable chunked copy, atomic upload promotion,
//! mtime preservation and verification.
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use super::verify::{VerificationMode, verify_download, verify_upload};
use super::{TransferItem, TransferOptions};
use crate::connection::ConnectionManager;
use crate::error::{Result, TransferError};
use crate::path::{display_path, file_name_remote, join_remote, parent_remote};
use crate::remote::{RemoteFs, SetStat};
use crate::transfer::cancel::CancelToken;
use crate::util::retry_operation;

pub const UPLOAD_TEMP_SUFFIX: &str = ".skiff-tmp";
pub const DOWNLOAD_PART_SUFFIX: &str = ".skiff-part";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOutcome {
    pub bytes: u64,
    /// Offset the first attempt started from; non-zero means a partial
    /// artifact from an earlier run was continued.
    pub resumed_from: u64,
    pub verification: Option<VerificationMode>,
}

/// Sibling temp name for an upload. Derived from the source identity so a
/// retry, or a later run, finds the same partial artifact.
pub fn temp_upload_path(item: &TransferItem) -> String {
    let mut h = Sha256::new();
    h.update(display_path(&item.local).to_string().as_bytes());
    h.update(b"\n");
    h.update(item.remote.as_bytes());
    h.update(format!("\n{}\n{}", item.size, item.mtime.unwrap_or(0)).as_bytes());
    let digest = hex::encode(h.finalize());
    let parent = parent_remote(&item.remote).unwrap_or_else(|| "/".to_string());
    let name = format!(".{}.{}{}", file_name_remote(&item.remote), &digest[..8], UPLOAD_TEMP_SUFFIX);
    join_remote(&parent, &name)
}

/// Part file for a download. The name carries the remote file's identity so
/// a part left by another version of it is never continued.
pub fn part_download_path(item: &TransferItem) -> PathBuf {
    let mut h = Sha256::new();
    h.update(item.remote.as_bytes());
    h.update(format!("\n{}\n{}", item.size, item.mtime.unwrap_or(0)).as_bytes());
    let digest = hex::encode(h.finalize());
    let mut name = item.local.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}{}", &digest[..8], DOWNLOAD_PART_SUFFIX));
    item.local.with_file_name(name)
}

/// Remove part files of `item.local` other than `keep`.
fn remove_stale_parts(item: &TransferItem, keep: &Path) {
    let (Some(dir), Some(name)) = (item.local.parent(), item.local.file_name()) else {
        return;
    };
    let prefix = format!("{}.", name.to_string_lossy());
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().to_string();
        if path == keep || !file_name.starts_with(&prefix) || !file_name.ends_with(DOWNLOAD_PART_SUFFIX) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("[exec] removed stale part={}", display_path(&path)),
            Err(e) => warn!("[exec] cannot remove stale part={} err={}", display_path(&path), e),
        }
    }
}

fn backup_path(tmp: &str) -> String {
    match tmp.strip_suffix(UPLOAD_TEMP_SUFFIX) {
        Some(stem) => format!("{stem}.skiff-bak"),
        None => format!("{tmp}.skiff-bak"),
    }
}

/// Copy until `src` is exhausted, `chunk` bytes at a time. Cancellation is
/// observed before every chunk; `progress` receives the absolute offset.
fn copy_chunks(
    src: &mut dyn Read,
    dst: &mut dyn Write,
    start: u64,
    chunk: usize,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(u64),
    map_read: &dyn Fn(&io::Error) -> TransferError,
    map_write: &dyn Fn(&io::Error) -> TransferError,
) -> Result<u64> {
    let mut buf = vec![0u8; chunk];
    let mut done = start;
    loop {
        cancel.check()?;
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(map_read(&e)),
        };
        dst.write_all(&buf[..n]).map_err(|e| map_write(&e))?;
        done += n as u64;
        progress(done);
    }
    dst.flush().map_err(|e| map_write(&e))?;
    Ok(done)
}

fn probe_upload_offset(fs: &dyn RemoteFs, tmp: &str, size: u64) -> Result<u64> {
    match fs.stat(tmp) {
        Ok(st) if st.size <= size => Ok(st.size),
        Ok(st) => {
            debug!("[exec] partial larger than source, restarting tmp={} size={}", tmp, st.size);
            Ok(0)
        }
        Err(TransferError::NotFound(_)) => Ok(0),
        Err(e) => Err(e),
    }
}

/// Runs planned file transfers against the connection manager. One executor
/// serves one job execution and shares its cancellation token.
pub struct Executor {
    conn: Arc<ConnectionManager>,
    options: TransferOptions,
    cancel: CancelToken,
}

impl Executor {
    pub fn new(conn: Arc<ConnectionManager>, options: TransferOptions, cancel: CancelToken) -> Self {
        Self { conn, options, cancel }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn upload(&self, item: &TransferItem, progress: &mut dyn FnMut(u64)) -> Result<FileOutcome> {
        let conn = self.conn.clone();
        // 取消时强制关闭传输, 让阻塞的读写立即返回
        let _interrupt = self.cancel.on_cancel(move || conn.interrupt());
        debug!("[exec] upload start src={} dest={} size={}", display_path(&item.local), item.remote, item.size);

        if item.size == 0 {
            return self.upload_empty(item);
        }

        let tmp = temp_upload_path(item);
        let mut resumed_from: Option<u64> = None;
        let mut promoted = false;
        let result = retry_operation(self.options.file_retry_attempts, &self.cancel, |_| {
            self.write_upload_temp(item, &tmp, &mut resumed_from, progress)?;
            self.promote(&tmp, &item.remote)?;
            promoted = true;
            Ok(())
        });
        if let Err(e) = result {
            if !promoted {
                self.discard_temp(&tmp);
            }
            if e.is_cancelled() {
                info!("[exec] upload cancelled dest={}", item.remote);
            }
            return Err(e);
        }

        self.apply_remote_mtime(item)?;
        let verification = if self.options.verify {
            Some(verify_upload(&self.conn, item, &self.options, &self.cancel)?)
        } else {
            None
        };
        let resumed_from = resumed_from.unwrap_or(0);
        info!(
            "[exec] upload done dest={} bytes={} resumed_from={} verify={:?}",
            item.remote, item.size, resumed_from, verification
        );
        Ok(FileOutcome { bytes: item.size, resumed_from, verification })
    }

    // empty file: creating it is the whole content, no temp needed
    fn upload_empty(&self, item: &TransferItem) -> Result<FileOutcome> {
        self.conn.execute_with_reconnect_retry("upload", &self.cancel, |fs| {
            let mut w = fs.open_write(&item.remote, 0)?;
            w.flush().map_err(|e| TransferError::from_io(&e, &item.remote))
        })?;
        self.apply_remote_mtime(item)?;
        let verification = if self.options.verify {
            Some(verify_upload(&self.conn, item, &self.options, &self.cancel)?)
        } else {
            None
        };
        Ok(FileOutcome { bytes: 0, resumed_from: 0, verification })
    }

    fn write_upload_temp(
        &self,
        item: &TransferItem,
        tmp: &str,
        resumed_from: &mut Option<u64>,
        progress: &mut dyn FnMut(u64),
    ) -> Result<()> {
        let cancel = &self.cancel;
        let local_ctx = display_path(&item.local).to_string();
        let map_read = |e: &io::Error| TransferError::from_local_io(e, &local_ctx);
        let map_write = |e: &io::Error| TransferError::from_io(e, tmp);
        self.conn.execute_with_reconnect_retry("upload", cancel, |fs| {
            let offset = if self.options.resume { probe_upload_offset(fs, tmp, item.size)? } else { 0 };
            resumed_from.get_or_insert(offset);
            if offset == item.size {
                debug!("[exec] temp already complete tmp={}", tmp);
                progress(offset);
                return Ok(());
            }
            if offset > 0 {
                info!("[exec] resuming upload tmp={} offset={}", tmp, offset);
            }
            let mut src = File::open(&item.local).map_err(|e| map_read(&e))?;
            if offset > 0 {
                src.seek(SeekFrom::Start(offset)).map_err(|e| map_read(&e))?;
            }
            let mut dst = fs.open_write(tmp, offset)?;
            progress(offset);
            copy_chunks(
                &mut src,
                &mut dst,
                offset,
                self.options.chunk_size,
                cancel,
                progress,
                &map_read,
                &map_write,
            )?;
            Ok(())
        })
    }

    /// Move the finished temp over `dest`. Uses an overwrite rename when the
    /// server has one; otherwise swaps through a backup and restores it if
    /// the second rename fails.
    fn promote(&self, tmp: &str, dest: &str) -> Result<()> {
        let cancel = &self.cancel;
        if self.conn.supports_atomic_overwrite_rename(cancel)? {
            debug!("[exec] promote atomic tmp={} dest={}", tmp, dest);
            return self
                .conn
                .execute_with_reconnect_retry("rename", cancel, |fs| fs.rename_overwrite(tmp, dest));
        }
        if !self.conn.exists(dest, cancel)? {
            debug!("[exec] promote rename tmp={} dest={}", tmp, dest);
            return self.conn.rename(tmp, dest, cancel);
        }

        let backup = backup_path(tmp);
        debug!("[exec] promote swap tmp={} dest={} backup={}", tmp, dest, backup);
        self.conn.rename(dest, &backup, cancel)?;
        if let Err(e) = self.conn.rename(tmp, dest, cancel) {
            warn!("[exec] promote failed, restoring original dest={} err={}", dest, e);
            if let Err(re) = self.conn.rename(&backup, dest, &CancelToken::new()) {
                error!("[exec] rollback failed, original kept at backup={} err={}", backup, re);
            }
            return Err(e);
        }
        if let Err(e) = self.conn.remove_file(&backup, &CancelToken::new()) {
            warn!("[exec] stale backup left behind backup={} err={}", backup, e);
        }
        Ok(())
    }

    fn discard_temp(&self, tmp: &str) {
        match self.conn.remove_file(tmp, &CancelToken::new()) {
            Ok(()) => debug!("[exec] temp removed tmp={}", tmp),
            Err(TransferError::NotFound(_)) => {}
            Err(e) => warn!("[exec] temp cleanup failed tmp={} err={}", tmp, e),
        }
    }

    fn apply_remote_mtime(&self, item: &TransferItem) -> Result<()> {
        let Some(mtime) = item.mtime.filter(|_| self.options.preserve_mtime) else {
            return Ok(());
        };
        let attrs = SetStat { mtime: Some(mtime), ..Default::default() };
        match self.conn.set_stat(&item.remote, &attrs, &self.cancel) {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!("[exec] could not set mtime dest={} err={}", item.remote, e);
                Ok(())
            }
        }
    }

    pub fn download(&self, item: &TransferItem, progress: &mut dyn FnMut(u64)) -> Result<FileOutcome> {
        let conn = self.conn.clone();
        let _interrupt = self.cancel.on_cancel(move || conn.interrupt());
        debug!("[exec] download start src={} dest={} size={}", item.remote, display_path(&item.local), item.size);

        let part = part_download_path(item);
        remove_stale_parts(item, &part);
        let mut resumed_from: Option<u64> = None;
        let result = retry_operation(self.options.file_retry_attempts, &self.cancel, |_| {
            self.write_download_part(item, &part, &mut resumed_from, progress)
        });
        if let Err(e) = result {
            // 保留 .skiff-part 以便续传
            if !self.options.resume
                && let Err(e) = std::fs::remove_file(&part)
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!("[exec] part cleanup failed part={} err={}", display_path(&part), e);
            }
            if e.is_cancelled() {
                info!("[exec] download cancelled dest={}", display_path(&item.local));
            }
            return Err(e);
        }

        finish_local(&part, &item.local)?;
        if let Some(mtime) = item.mtime.filter(|_| self.options.preserve_mtime) {
            set_local_mtime(&item.local, mtime);
        }
        let verification = if self.options.verify {
            Some(verify_download(&self.conn, item, &self.options, &self.cancel)?)
        } else {
            None
        };
        let resumed_from = resumed_from.unwrap_or(0);
        info!(
            "[exec] download done dest={} bytes={} resumed_from={} verify={:?}",
            display_path(&item.local),
            item.size,
            resumed_from,
            verification
        );
        Ok(FileOutcome { bytes: item.size, resumed_from, verification })
    }

    fn write_download_part(
        &self,
        item: &TransferItem,
        part: &Path,
        resumed_from: &mut Option<u64>,
        progress: &mut dyn FnMut(u64),
    ) -> Result<()> {
        let cancel = &self.cancel;
        let part_ctx = display_path(part).to_string();
        let map_read = |e: &io::Error| TransferError::from_io(e, &item.remote);
        let map_write = |e: &io::Error| TransferError::from_local_io(e, &part_ctx);
        self.conn.execute_with_reconnect_retry("download", cancel, |fs| {
            let existing = if self.options.resume {
                std::fs::metadata(part).map(|m| m.len()).unwrap_or(0)
            } else {
                0
            };
            let offset = if existing <= item.size { existing } else { 0 };
            resumed_from.get_or_insert(offset);
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(offset == 0)
                .open(part)
                .map_err(|e| map_write(&e))?;
            if offset == item.size {
                progress(offset);
                return Ok(());
            }
            if offset > 0 {
                info!("[exec] resuming download part={} offset={}", part_ctx, offset);
                file.set_len(offset).map_err(|e| map_write(&e))?;
                file.seek(SeekFrom::Start(offset)).map_err(|e| map_write(&e))?;
            }
            let mut src = fs.open_read(&item.remote, offset)?;
            progress(offset);
            copy_chunks(
                &mut src,
                &mut file,
                offset,
                self.options.chunk_size,
                cancel,
                progress,
                &map_read,
                &map_write,
            )?;
            Ok(())
        })
    }
}

fn finish_local(part: &Path, dest: &Path) -> Result<()> {
    let ctx = display_path(dest).to_string();
    // Windows rename does not replace an existing file
    if cfg!(windows) && dest.is_file() {
        std::fs::remove_file(dest).map_err(|e| TransferError::from_local_io(&e, &ctx))?;
    }
    std::fs::rename(part, dest).map_err(|e| TransferError::from_local_io(&e, &ctx))
}

fn set_local_mtime(path: &Path, mtime: u64) {
    let t = UNIX_EPOCH + Duration::from_secs(mtime);
    let res = OpenOptions::new().write(true).open(path).and_then(|f| f.set_modified(t));
    if let Err(e) = res {
        warn!("[exec] could not set mtime dest={} err={}", display_path(path), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> TransferItem {
        TransferItem {
            local: PathBuf::from("/home/u/a.txt"),
            remote: "/srv/a.txt".into(),
            display_name: "a.txt".into(),
            size: 10,
            mtime: Some(1_700_000_000),
        }
    }

    #[test]
    fn temp_name_is_stable_hidden_sibling() {
        let t = temp_upload_path(&item());
        assert_eq!(t, temp_upload_path(&item()));
        assert!(t.starts_with("/srv/.a.txt."));
        assert!(t.ends_with(UPLOAD_TEMP_SUFFIX));
        let mut other = item();
        other.size = 11;
        assert_ne!(t, temp_upload_path(&other));
    }

    #[test]
    fn part_and_backup_names() {
        let mut it = item();
        it.local = PathBuf::from("/d/a.txt");
        let part = part_download_path(&it);
        let name = part.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(part.parent(), Some(Path::new("/d")));
        assert!(name.starts_with("a.txt.") && name.ends_with(DOWNLOAD_PART_SUFFIX), "{name}");
        it.mtime = Some(1_700_000_999);
        assert_ne!(part, part_download_path(&it));
        assert_eq!(backup_path("/srv/.a.txt.0123abcd.skiff-tmp"), "/srv/.a.txt.0123abcd.skiff-bak");
    }

    #[test]
    fn stale_parts_of_the_same_file_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut it = item();
        it.local = dir.path().join("a.txt");
        let keep = part_download_path(&it);
        let stale = dir.path().join("a.txt.0badf00d.skiff-part");
        let unrelated = dir.path().join("b.txt.0badf00d.skiff-part");
        for p in [&keep, &stale, &unrelated] {
            std::fs::write(p, b"x").unwrap();
        }
        remove_stale_parts(&it, &keep);
        assert!(keep.exists());
        assert!(!stale.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn copy_observes_cancel_between_chunks() {
        let token = CancelToken::new();
        let data = vec![1u8; 100];
        let mut src: &[u8] = &data;
        let mut dst: Vec<u8> = Vec::new();
        let t = token.clone();
        let mut progress = |done: u64| {
            if done >= 20 {
                t.cancel();
            }
        };
        let map = |e: &io::Error| TransferError::Io(e.to_string());
        let err = copy_chunks(&mut src, &mut dst, 0, 10, &token, &mut progress, &map, &map).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(dst.len(), 20);
    }
}
