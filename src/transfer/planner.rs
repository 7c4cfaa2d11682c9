use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use super::conflict::{ConflictResolver, next_free_local, next_free_remote};
use super::{DeleteStep, Direction, TransferItem, TransferPlan};
use crate::connection::ConnectionManager;
use crate::error::{Result, TransferError};
use crate::path::{
    display_path, file_name_remote, join_remote, local_path_key, normalize_remote, parent_remote,
    remote_depth, shell_quote,
};
use crate::prompt::{ConflictChoice, ConflictRequest, EntryDetails, Prompter, SymlinkChoice};
use crate::remote::RemoteStat;
use crate::transfer::cancel::CancelToken;
use crate::util::system_time_secs;

fn local_err(e: &std::io::Error, p: &Path) -> TransferError {
    TransferError::from_local_io(e, &display_path(p).to_string())
}

fn walk_err(e: walkdir::Error) -> TransferError {
    let ctx = e.path().map(|p| display_path(p).to_string()).unwrap_or_default();
    match e.io_error() {
        Some(io) => TransferError::from_local_io(io, &ctx),
        None => TransferError::Local(format!("{ctx}: {e}")),
    }
}

/// Stat of `dest` if it exists. Some servers answer `exists()` with a false
/// negative for directories, so a negative answer is double-checked against
/// a listing of the parent. This is a heuristic, not a guarantee.
pub fn existing_remote_entry(
    conn: &ConnectionManager,
    dest: &str,
    cancel: &CancelToken,
) -> Result<Option<RemoteStat>> {
    if conn.exists(dest, cancel)? {
        return conn.lstat(dest, cancel).map(Some);
    }
    let Some(parent) = parent_remote(dest) else {
        return Ok(None);
    };
    let name = file_name_remote(dest);
    match conn.list_dir(&parent, cancel) {
        Ok(entries) => {
            let found = entries.into_iter().find(|e| e.name == name).map(|e| e.stat);
            if found.is_some() {
                debug!("[plan] exists() false negative corrected by listing path={}", dest);
            }
            Ok(found)
        }
        Err(TransferError::NotFound(_)) | Err(TransferError::NotADirectory(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Create `path` unless it already is a directory. Parents must exist.
pub fn ensure_remote_dir(conn: &ConnectionManager, path: &str, cancel: &CancelToken) -> Result<()> {
    match conn.stat(path, cancel) {
        Ok(st) if st.is_dir => Ok(()),
        Ok(_) => Err(TransferError::NotADirectory(path.to_string())),
        Err(TransferError::NotFound(_)) => {
            debug!("[plan] mkdir path={}", path);
            match conn.create_dir(path, cancel) {
                Ok(()) => Ok(()),
                Err(e) => match conn.stat(path, cancel) {
                    Ok(st) if st.is_dir => Ok(()),
                    _ => Err(e),
                },
            }
        }
        Err(e) => Err(e),
    }
}

fn sort_remote_dirs(dirs: &mut Vec<String>) {
    dirs.sort_by(|a, b| remote_depth(a).cmp(&remote_depth(b)).then_with(|| a.cmp(b)));
    dirs.dedup();
}

fn sort_local_dirs(dirs: &mut Vec<PathBuf>) {
    dirs.sort_by(|a, b| {
        a.components()
            .count()
            .cmp(&b.components().count())
            .then_with(|| local_path_key(a).cmp(&local_path_key(b)))
    });
    dirs.dedup_by(|a, b| local_path_key(a) == local_path_key(b));
}

fn local_details(path: &Path, md: &std::fs::Metadata) -> EntryDetails {
    EntryDetails {
        path: display_path(path).to_string(),
        size: if md.is_dir() { 0 } else { md.len() },
        mtime: md.modified().ok().and_then(system_time_secs),
        is_dir: md.is_dir(),
    }
}

fn remote_details(path: &str, st: &RemoteStat) -> EntryDetails {
    EntryDetails { path: path.to_string(), size: st.size, mtime: st.mtime, is_dir: st.is_dir }
}

/// Plan an upload of local `sources` into `remote_dir`. Directory sources
/// are copied as a whole (`dir` lands at `remote_dir/dir`).
pub fn plan_upload(
    conn: &ConnectionManager,
    resolver: &mut ConflictResolver<'_>,
    sources: &[PathBuf],
    remote_dir: &str,
    cancel: &CancelToken,
) -> Result<TransferPlan> {
    let remote_dir = normalize_remote(remote_dir);
    let mut plan = TransferPlan::new(Direction::Upload);
    let mut dirs: Vec<String> = Vec::new();
    match existing_remote_entry(conn, &remote_dir, cancel)? {
        Some(st) if st.is_dir => {}
        Some(_) => {
            if !conn.stat(&remote_dir, cancel)?.is_dir {
                return Err(TransferError::NotADirectory(remote_dir));
            }
        }
        None => dirs.push(remote_dir.clone()),
    }

    let allow_apply_to_all = sources.len() > 1;
    let mut seen = HashSet::new();
    for src in sources {
        cancel.check()?;
        if !seen.insert(local_path_key(src)) {
            debug!("[plan] duplicate source skipped path={}", display_path(src));
            continue;
        }
        let md = std::fs::metadata(src).map_err(|e| local_err(&e, src))?;
        let name = src
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| TransferError::Local(format!("no file name: {}", display_path(src))))?;
        let mut dest = join_remote(&remote_dir, &name);

        if let Some(existing) = existing_remote_entry(conn, &dest, cancel)? {
            let request = ConflictRequest {
                source: local_details(src, &md),
                destination: remote_details(&dest, &existing),
                allow_apply_to_all,
            };
            match resolver.resolve(&request) {
                ConflictChoice::Cancel => return Err(TransferError::Cancelled),
                ConflictChoice::Duplicate => dest = next_free_remote(conn, &dest, cancel)?,
                ConflictChoice::Overwrite => {
                    // 同类型: 目录合并, 文件在提升时替换
                    let same_kind = md.is_dir() == existing.is_dir && !existing.is_symlink;
                    if !same_kind {
                        remove_remote_recursive(conn, &dest, cancel)?;
                    }
                }
            }
        }

        if md.is_dir() {
            dirs.push(dest.clone());
            collect_local_tree(src, &dest, &mut dirs, &mut plan.files, cancel)?;
        } else {
            plan.files.push(TransferItem {
                local: src.clone(),
                remote: dest,
                display_name: name,
                size: md.len(),
                mtime: md.modified().ok().and_then(system_time_secs),
            });
        }
    }
    sort_remote_dirs(&mut dirs);
    plan.remote_dirs = dirs;
    info!(
        "[plan] upload dirs={} files={} bytes={}",
        plan.remote_dirs.len(),
        plan.files.len(),
        plan.total_bytes()
    );
    Ok(plan)
}

fn collect_local_tree(
    root: &Path,
    dest_root: &str,
    dirs: &mut Vec<String>,
    files: &mut Vec<TransferItem>,
    cancel: &CancelToken,
) -> Result<()> {
    let root_name = root.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    for entry in WalkDir::new(root).min_depth(1).follow_links(false).sort_by_file_name() {
        cancel.check()?;
        let entry = entry.map_err(walk_err)?;
        let rel_path = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let rel = rel_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        let remote = join_remote(dest_root, &rel);
        let ft = entry.file_type();
        if ft.is_symlink() {
            debug!("[plan] local symlink skipped path={}", display_path(entry.path()));
        } else if ft.is_dir() {
            dirs.push(remote);
        } else if ft.is_file() {
            let md = entry.metadata().map_err(walk_err)?;
            files.push(TransferItem {
                local: entry.path().to_path_buf(),
                remote,
                display_name: format!("{}/{}", root_name, rel),
                size: md.len(),
                mtime: md.modified().ok().and_then(system_time_secs),
            });
        }
    }
    Ok(())
}

fn remove_local(path: &Path) -> Result<()> {
    let md = std::fs::symlink_metadata(path).map_err(|e| local_err(&e, path))?;
    let res = if md.is_dir() { std::fs::remove_dir_all(path) } else { std::fs::remove_file(path) };
    res.map_err(|e| local_err(&e, path))
}

/// Plan a download of remote `sources` into `local_dir`. Local collisions are
/// resolved here, before any byte moves.
pub fn plan_download(
    conn: &ConnectionManager,
    resolver: &mut ConflictResolver<'_>,
    sources: &[String],
    local_dir: &Path,
    cancel: &CancelToken,
) -> Result<TransferPlan> {
    let mut plan = TransferPlan::new(Direction::Download);
    let mut dirs: Vec<PathBuf> = Vec::new();
    match std::fs::metadata(local_dir) {
        Ok(md) if md.is_dir() => {}
        Ok(_) => {
            return Err(TransferError::Local(format!(
                "not a directory: {}",
                display_path(local_dir)
            )));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => dirs.push(local_dir.to_path_buf()),
        Err(e) => return Err(local_err(&e, local_dir)),
    }

    let allow_apply_to_all = sources.len() > 1;
    let mut seen = HashSet::new();
    for src in sources {
        cancel.check()?;
        let src = normalize_remote(src);
        if !seen.insert(src.clone()) {
            continue;
        }
        let name = file_name_remote(&src);
        if name.is_empty() {
            return Err(TransferError::OperationFailed("cannot download the remote root".into()));
        }
        // follows links: a link to a file is fetched as that file
        let st = conn.stat(&src, cancel)?;
        let mut dest = local_dir.join(&name);

        if let Ok(existing) = std::fs::symlink_metadata(&dest) {
            let request = ConflictRequest {
                source: remote_details(&src, &st),
                destination: local_details(&dest, &existing),
                allow_apply_to_all,
            };
            match resolver.resolve(&request) {
                ConflictChoice::Cancel => return Err(TransferError::Cancelled),
                ConflictChoice::Duplicate => dest = next_free_local(&dest)?,
                ConflictChoice::Overwrite => {
                    let file_over_file =
                        !st.is_dir && existing.is_file() && !existing.file_type().is_symlink();
                    // a file over a file is replaced by the final local rename
                    if !file_over_file {
                        remove_local(&dest)?;
                    }
                }
            }
        }

        if st.is_dir {
            dirs.push(dest.clone());
            walk_remote(conn, &src, &dest, &mut dirs, &mut plan.files, cancel)?;
        } else {
            plan.files.push(TransferItem {
                local: dest,
                remote: src.clone(),
                display_name: name,
                size: st.size,
                mtime: st.mtime,
            });
        }
    }
    sort_local_dirs(&mut dirs);
    plan.local_dirs = dirs;
    info!(
        "[plan] download dirs={} files={} bytes={}",
        plan.local_dirs.len(),
        plan.files.len(),
        plan.total_bytes()
    );
    Ok(plan)
}

// BFS over a remote tree; directory links are listed but never entered
fn walk_remote(
    conn: &ConnectionManager,
    root: &str,
    local_root: &Path,
    dirs: &mut Vec<PathBuf>,
    files: &mut Vec<TransferItem>,
    cancel: &CancelToken,
) -> Result<()> {
    let root_name = file_name_remote(root);
    let mut q: VecDeque<(String, PathBuf, String)> = VecDeque::new();
    q.push_back((root.to_string(), local_root.to_path_buf(), root_name));
    while let Some((cur, local_cur, rel_prefix)) = q.pop_front() {
        cancel.check()?;
        for entry in conn.list_dir(&cur, cancel)? {
            let rel = format!("{}/{}", rel_prefix, entry.name);
            let local = local_cur.join(&entry.name);
            if entry.stat.is_symlink {
                match conn.stat(&entry.path, cancel) {
                    Ok(t) if t.is_dir => {
                        debug!("[plan] directory link not traversed path={}", entry.path);
                    }
                    Ok(t) => files.push(TransferItem {
                        local,
                        remote: entry.path,
                        display_name: rel,
                        size: t.size,
                        mtime: t.mtime,
                    }),
                    Err(TransferError::NotFound(_)) => {
                        debug!("[plan] dangling link skipped path={}", entry.path);
                    }
                    Err(e) => return Err(e),
                }
            } else if entry.stat.is_dir {
                dirs.push(local.clone());
                q.push_back((entry.path, local, rel));
            } else {
                files.push(TransferItem {
                    local,
                    remote: entry.path,
                    display_name: rel,
                    size: entry.stat.size,
                    mtime: entry.stat.mtime,
                });
            }
        }
    }
    Ok(())
}

/// Where a remote symlink points, absolute and normalized. Prefers
/// `readlink -f` on the server and falls back to a single SFTP readlink.
pub fn resolve_link_target(
    conn: &ConnectionManager,
    link: &str,
    cancel: &CancelToken,
) -> Result<String> {
    match conn.run_command(&format!("readlink -f {}", shell_quote(link)), cancel) {
        Ok(out) if !out.trim().is_empty() => return Ok(normalize_remote(out.trim())),
        Ok(_) => {}
        Err(e) if e.is_cancelled() => return Err(e),
        Err(e) => debug!("[plan] readlink command failed, using sftp readlink err={}", e),
    }
    let raw = conn.read_link(link, cancel)?;
    if raw.starts_with('/') {
        Ok(normalize_remote(&raw))
    } else {
        let parent = parent_remote(link).unwrap_or_else(|| "/".to_string());
        Ok(join_remote(&parent, &raw))
    }
}

/// Bottom-up removal steps for `paths`. Symlinks ask the collaborator
/// whether to remove the link or what it points at.
pub fn plan_delete(
    conn: &ConnectionManager,
    prompter: &dyn Prompter,
    paths: &[String],
    cancel: &CancelToken,
) -> Result<Vec<DeleteStep>> {
    let mut steps = Vec::new();
    for p in paths {
        cancel.check()?;
        let p = normalize_remote(p);
        if p == "/" {
            return Err(TransferError::PermissionDenied("refusing to delete /".into()));
        }
        let st = conn.lstat(&p, cancel)?;
        if st.is_symlink {
            let target = resolve_link_target(conn, &p, cancel)?;
            match prompter.confirm_symlink(&p, &target) {
                SymlinkChoice::OperateOnLink => steps.push(DeleteStep::Link(p)),
                SymlinkChoice::FollowTarget => {
                    let tst = conn.lstat(&target, cancel)?;
                    expand_delete(conn, &target, &tst, &mut steps, cancel)?;
                }
                SymlinkChoice::Cancel => return Err(TransferError::Cancelled),
            }
        } else {
            expand_delete(conn, &p, &st, &mut steps, cancel)?;
        }
    }
    info!("[plan] delete steps={}", steps.len());
    Ok(steps)
}

fn expand_delete(
    conn: &ConnectionManager,
    path: &str,
    st: &RemoteStat,
    steps: &mut Vec<DeleteStep>,
    cancel: &CancelToken,
) -> Result<()> {
    if !st.is_dir {
        steps.push(if st.is_symlink {
            DeleteStep::Link(path.to_string())
        } else {
            DeleteStep::File(path.to_string())
        });
        return Ok(());
    }
    for entry in conn.list_dir(path, cancel)? {
        cancel.check()?;
        if entry.stat.is_dir {
            expand_delete(conn, &entry.path, &entry.stat, steps, cancel)?;
        } else if entry.stat.is_symlink {
            steps.push(DeleteStep::Link(entry.path));
        } else {
            steps.push(DeleteStep::File(entry.path));
        }
    }
    steps.push(DeleteStep::Dir(path.to_string()));
    Ok(())
}

pub fn apply_delete_step(conn: &ConnectionManager, step: &DeleteStep, cancel: &CancelToken) -> Result<()> {
    debug!("[plan] delete step={:?}", step);
    match step {
        DeleteStep::File(p) | DeleteStep::Link(p) => conn.remove_file(p, cancel),
        DeleteStep::Dir(p) => conn.remove_dir(p, cancel),
    }
}

/// Delete a remote file, link or whole directory tree; links are removed,
/// never followed.
pub fn remove_remote_recursive(
    conn: &ConnectionManager,
    path: &str,
    cancel: &CancelToken,
) -> Result<()> {
    let st = conn.lstat(path, cancel)?;
    let mut steps = Vec::new();
    expand_delete(conn, path, &st, &mut steps, cancel)?;
    for step in &steps {
        apply_delete_step(conn, step, cancel)?;
    }
    Ok(())
}
