//! In-process remote filesystem with fault injection and an operation log.
//! Drives the planner, executor, connection manager and queue in tests
//! without a network.
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ConnectRequest, Connector, RemoteEntry, RemoteFs, RemoteStat, SetStat};
use crate::auth::AuthCredential;
use crate::error::{Result, TransferError};
use crate::known_hosts::fingerprint_sha256;
use crate::path::{file_name_remote, normalize_remote, parent_remote};

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, mtime: u64, perm: u32 },
    Dir { mtime: u64, perm: u32 },
    Symlink { target: String },
}

/// Mutating (and a few observing) operations in the order the server saw them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryEvent {
    Connect,
    Close,
    CreateDir(String),
    RemoveFile(String),
    RemoveDir(String),
    Rename { from: String, to: String },
    OpenWrite { path: String, offset: u64 },
    OpenRead { path: String, offset: u64 },
    Symlink { target: String, link: String },
    SetStat(String),
    Command(String),
}

type BytesHook = Box<dyn FnOnce() + Send>;

struct Faults {
    failing_connects: VecDeque<TransferError>,
    drop_after_bytes: Option<u64>,
    bytes_hook: Option<(u64, BytesHook)>,
    atomic_rename: bool,
    dir_exists_false_negative: bool,
    failing_renames_to: Vec<String>,
}

struct State {
    nodes: BTreeMap<String, Node>,
    events: Vec<MemoryEvent>,
    faults: Faults,
    bytes_moved: u64,
    hook_bytes: u64,
    connect_attempts: u32,
    connects: u32,
    sessions: Vec<Arc<AtomicBool>>,
    password: Option<String>,
    host_key: (String, Vec<u8>),
}

/// Shared server state. Clones refer to the same filesystem.
#[derive(Clone)]
pub struct MemoryServer {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn dropped() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection dropped by server")
}

impl MemoryServer {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir { mtime: now_secs(), perm: 0o755 });
        Self {
            state: Arc::new(Mutex::new(State {
                nodes,
                events: Vec::new(),
                faults: Faults {
                    failing_connects: VecDeque::new(),
                    drop_after_bytes: None,
                    bytes_hook: None,
                    atomic_rename: false,
                    dir_exists_false_negative: false,
                    failing_renames_to: Vec::new(),
                },
                bytes_moved: 0,
                hook_bytes: 0,
                connect_attempts: 0,
                connects: 0,
                sessions: Vec::new(),
                password: None,
                host_key: ("ssh-ed25519".to_string(), b"memory-host-key".to_vec()),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { server: self.clone() }
    }

    // ---- seeding and inspection ----

    /// Create a directory and any missing parents.
    pub fn mkdir_all(&self, path: &str) {
        let path = normalize_remote(path);
        let mut st = self.lock();
        let mut cur = String::new();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            cur = format!("{}/{}", cur, seg);
            st.nodes.entry(cur.clone()).or_insert(Node::Dir { mtime: now_secs(), perm: 0o755 });
        }
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.put_file_with_mtime(path, data, now_secs());
    }

    pub fn put_file_with_mtime(&self, path: &str, data: &[u8], mtime: u64) {
        let path = normalize_remote(path);
        if let Some(parent) = parent_remote(&path) {
            self.mkdir_all(&parent);
        }
        self.lock().nodes.insert(path, Node::File { data: data.to_vec(), mtime, perm: 0o644 });
    }

    pub fn put_symlink(&self, link: &str, target: &str) {
        let link = normalize_remote(link);
        if let Some(parent) = parent_remote(&link) {
            self.mkdir_all(&parent);
        }
        self.lock().nodes.insert(link, Node::Symlink { target: target.to_string() });
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().nodes.get(&normalize_remote(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn mtime(&self, path: &str) -> Option<u64> {
        match self.lock().nodes.get(&normalize_remote(path)) {
            Some(Node::File { mtime, .. }) | Some(Node::Dir { mtime, .. }) => Some(*mtime),
            _ => None,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(&normalize_remote(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.lock().nodes.get(&normalize_remote(path)), Some(Node::Dir { .. }))
    }

    /// Every path on the server, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.lock().nodes.keys().cloned().collect()
    }

    pub fn events(&self) -> Vec<MemoryEvent> {
        self.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    /// Connect attempts including injected failures.
    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Successfully opened sessions.
    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    // ---- fault injection ----

    /// The next connect attempts fail with these errors, in order.
    pub fn fail_next_connects(&self, errors: Vec<TransferError>) {
        self.lock().faults.failing_connects.extend(errors);
    }

    /// Kill every live session once `n` more bytes have been read or
    /// written. One-shot.
    pub fn drop_after_bytes(&self, n: u64) {
        let mut st = self.lock();
        st.bytes_moved = 0;
        st.faults.drop_after_bytes = Some(n);
    }

    /// Run `hook` on the transferring thread once `n` more bytes have been
    /// read or written, after the server lock is released. One-shot.
    pub fn on_bytes<F>(&self, n: u64, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut st = self.lock();
        st.hook_bytes = 0;
        st.faults.bytes_hook = Some((n, Box::new(hook)));
    }

    /// Drop every live session now.
    pub fn drop_sessions(&self) {
        let mut st = self.lock();
        for s in st.sessions.drain(..) {
            s.store(false, Ordering::SeqCst);
        }
    }

    pub fn set_atomic_rename(&self, enabled: bool) {
        self.lock().faults.atomic_rename = enabled;
    }

    /// `exists()` answers false for directories, like some servers do.
    pub fn set_dir_exists_false_negative(&self, enabled: bool) {
        self.lock().faults.dir_exists_false_negative = enabled;
    }

    /// The next rename whose destination is `to` fails.
    pub fn fail_rename_to(&self, to: &str) {
        self.lock().faults.failing_renames_to.push(normalize_remote(to));
    }

    /// Require password authentication with this secret.
    pub fn set_password(&self, password: Option<&str>) {
        self.lock().password = password.map(str::to_string);
    }

    pub fn set_host_key(&self, algorithm: &str, key: &[u8]) {
        self.lock().host_key = (algorithm.to_string(), key.to_vec());
    }

    pub fn host_key_fingerprint(&self) -> String {
        fingerprint_sha256(&self.lock().host_key.1)
    }
}

impl State {
    fn resolve(&self, path: &str) -> Result<String> {
        let mut cur = normalize_remote(path);
        for _ in 0..16 {
            match self.nodes.get(&cur) {
                Some(Node::Symlink { target }) => {
                    cur = if target.starts_with('/') {
                        normalize_remote(target)
                    } else {
                        let parent = parent_remote(&cur).unwrap_or_else(|| "/".to_string());
                        crate::path::join_remote(&parent, target)
                    };
                }
                Some(_) => return Ok(cur),
                None => return Err(TransferError::NotFound(cur)),
            }
        }
        Err(TransferError::OperationFailed(format!("too many levels of symbolic links: {path}")))
    }

    fn stat_node(&self, path: &str) -> Result<RemoteStat> {
        let node = self.nodes.get(path).ok_or_else(|| TransferError::NotFound(path.to_string()))?;
        Ok(match node {
            Node::File { data, mtime, perm } => RemoteStat {
                size: data.len() as u64,
                mtime: Some(*mtime),
                perm: Some(*perm),
                uid: Some(1000),
                gid: Some(1000),
                ..Default::default()
            },
            Node::Dir { mtime, perm } => RemoteStat {
                is_dir: true,
                mtime: Some(*mtime),
                perm: Some(*perm),
                uid: Some(1000),
                gid: Some(1000),
                ..Default::default()
            },
            Node::Symlink { target } => RemoteStat {
                size: target.len() as u64,
                is_symlink: true,
                perm: Some(0o777),
                ..Default::default()
            },
        })
    }

    fn require_parent_dir(&self, path: &str) -> Result<()> {
        let parent = parent_remote(path).ok_or_else(|| TransferError::PermissionDenied(path.into()))?;
        match self.nodes.get(&parent) {
            Some(Node::Dir { .. }) => Ok(()),
            Some(_) => Err(TransferError::NotADirectory(parent)),
            None => Err(TransferError::NotFound(parent)),
        }
    }

    fn has_children(&self, dir: &str) -> bool {
        let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
        self.nodes.range(prefix.clone()..).next().is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    /// Account for `want` bytes of traffic; returns how many may move before
    /// an injected drop fires (`None` when the drop fires now).
    fn take_bytes_hook(&mut self, n: usize) -> Option<BytesHook> {
        let limit = self.faults.bytes_hook.as_ref()?.0;
        self.hook_bytes += n as u64;
        if self.hook_bytes < limit {
            return None;
        }
        self.faults.bytes_hook.take().map(|(_, hook)| hook)
    }

    fn meter(&mut self, want: usize) -> Option<usize> {
        let Some(limit) = self.faults.drop_after_bytes else {
            self.bytes_moved += want as u64;
            return Some(want);
        };
        let left = limit.saturating_sub(self.bytes_moved);
        if left == 0 && want > 0 {
            self.faults.drop_after_bytes = None;
            for s in self.sessions.drain(..) {
                s.store(false, Ordering::SeqCst);
            }
            return None;
        }
        let n = want.min(left as usize);
        self.bytes_moved += n as u64;
        Some(n)
    }
}

/// Opens [`MemorySession`]s against a [`MemoryServer`], checking the host key
/// and (optionally) a password like a real connector would.
pub struct MemoryConnector {
    server: MemoryServer,
}

impl Connector for MemoryConnector {
    fn open(&self, request: &ConnectRequest<'_>) -> Result<Arc<dyn RemoteFs>> {
        let (algorithm, fingerprint, password) = {
            let mut st = self.server.lock();
            st.connect_attempts += 1;
            if let Some(err) = st.faults.failing_connects.pop_front() {
                return Err(err);
            }
            (st.host_key.0.clone(), fingerprint_sha256(&st.host_key.1), st.password.clone())
        };
        let profile = request.profile;
        if !request.host_keys.verify(&profile.host, profile.port, &algorithm, &fingerprint) {
            return Err(TransferError::HostKeyRejected {
                host: profile.host.clone(),
                port: profile.port,
                algorithm,
            });
        }
        if let Some(expected) = password {
            let ok = request
                .methods
                .iter()
                .any(|m| matches!(m, AuthCredential::Password(p) if *p == expected));
            if !ok {
                let attempted: Vec<String> =
                    request.methods.iter().map(|m| m.kind().to_string()).collect();
                return Err(TransferError::AuthFailed {
                    addr: profile.addr(),
                    attempted: attempted.join(", "),
                });
            }
        }
        let alive = Arc::new(AtomicBool::new(true));
        let mut st = self.server.lock();
        st.connects += 1;
        st.sessions.push(alive.clone());
        st.events.push(MemoryEvent::Connect);
        Ok(Arc::new(MemorySession { server: self.server.clone(), alive }))
    }
}

pub struct MemorySession {
    server: MemoryServer,
    alive: Arc<AtomicBool>,
}

impl MemorySession {
    fn state(&self) -> Result<MutexGuard<'_, State>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransferError::SessionClosed("memory session".into()));
        }
        Ok(self.server.lock())
    }
}

impl RemoteFs for MemorySession {
    fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let st = self.state()?;
        let dir = st.resolve(path)?;
        if !matches!(st.nodes.get(&dir), Some(Node::Dir { .. })) {
            return Err(TransferError::NotADirectory(dir));
        }
        let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
        let mut out = Vec::new();
        for key in st.nodes.keys().filter(|k| k.starts_with(&prefix) && **k != dir) {
            if key[prefix.len()..].contains('/') {
                continue;
            }
            out.push(RemoteEntry {
                name: file_name_remote(key),
                path: key.clone(),
                stat: st.stat_node(key)?,
            });
        }
        Ok(out)
    }

    fn stat(&self, path: &str) -> Result<RemoteStat> {
        let st = self.state()?;
        let real = st.resolve(path)?;
        st.stat_node(&real)
    }

    fn lstat(&self, path: &str) -> Result<RemoteStat> {
        self.state()?.stat_node(&normalize_remote(path))
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let st = self.state()?;
        match st.nodes.get(&normalize_remote(path)) {
            Some(Node::Dir { .. }) if st.faults.dir_exists_false_negative => Ok(false),
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn Read + Send>> {
        let mut st = self.state()?;
        let real = st.resolve(path)?;
        match st.nodes.get(&real) {
            Some(Node::File { .. }) => {}
            Some(_) => return Err(TransferError::OperationFailed(format!("not a file: {real}"))),
            None => return Err(TransferError::NotFound(real)),
        }
        st.events.push(MemoryEvent::OpenRead { path: real.clone(), offset });
        Ok(Box::new(MemoryReader {
            server: self.server.clone(),
            alive: self.alive.clone(),
            path: real,
            pos: offset,
        }))
    }

    fn open_write(&self, path: &str, offset: u64) -> Result<Box<dyn Write + Send>> {
        let mut st = self.state()?;
        let path = normalize_remote(path);
        st.require_parent_dir(&path)?;
        match st.nodes.get_mut(&path) {
            Some(Node::File { data, .. }) => {
                if offset == 0 {
                    data.clear();
                } else if offset > data.len() as u64 {
                    return Err(TransferError::OperationFailed(format!(
                        "offset {offset} past end of {path}"
                    )));
                }
            }
            Some(_) => return Err(TransferError::OperationFailed(format!("not a file: {path}"))),
            None if offset == 0 => {
                st.nodes.insert(
                    path.clone(),
                    Node::File { data: Vec::new(), mtime: now_secs(), perm: 0o644 },
                );
            }
            None => return Err(TransferError::NotFound(path)),
        }
        st.events.push(MemoryEvent::OpenWrite { path: path.clone(), offset });
        Ok(Box::new(MemoryWriter {
            server: self.server.clone(),
            alive: self.alive.clone(),
            path,
            pos: offset,
        }))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut st = self.state()?;
        let (from, to) = (normalize_remote(from), normalize_remote(to));
        if let Some(i) = st.faults.failing_renames_to.iter().position(|p| *p == to) {
            st.faults.failing_renames_to.remove(i);
            return Err(TransferError::OperationFailed(format!("rename to {to} refused")));
        }
        if !st.nodes.contains_key(&from) {
            return Err(TransferError::NotFound(from));
        }
        if st.nodes.contains_key(&to) {
            return Err(TransferError::OperationFailed(format!("destination exists: {to}")));
        }
        st.require_parent_dir(&to)?;
        move_subtree(&mut st.nodes, &from, &to);
        st.events.push(MemoryEvent::Rename { from, to });
        Ok(())
    }

    fn supports_atomic_overwrite_rename(&self) -> bool {
        self.server.lock().faults.atomic_rename
    }

    fn rename_overwrite(&self, from: &str, to: &str) -> Result<()> {
        let mut st = self.state()?;
        if !st.faults.atomic_rename {
            return Err(TransferError::Unsupported("atomic overwrite rename".into()));
        }
        let (from, to) = (normalize_remote(from), normalize_remote(to));
        if !st.nodes.contains_key(&from) {
            return Err(TransferError::NotFound(from));
        }
        if matches!(st.nodes.get(&to), Some(Node::Dir { .. })) {
            return Err(TransferError::OperationFailed(format!("destination is a directory: {to}")));
        }
        st.nodes.remove(&to);
        move_subtree(&mut st.nodes, &from, &to);
        st.events.push(MemoryEvent::Rename { from, to });
        Ok(())
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        let mut st = self.state()?;
        let path = normalize_remote(path);
        match st.nodes.get(&path) {
            Some(Node::Dir { .. }) => {
                Err(TransferError::OperationFailed(format!("is a directory: {path}")))
            }
            Some(_) => {
                st.nodes.remove(&path);
                st.events.push(MemoryEvent::RemoveFile(path));
                Ok(())
            }
            None => Err(TransferError::NotFound(path)),
        }
    }

    fn remove_dir(&self, path: &str) -> Result<()> {
        let mut st = self.state()?;
        let path = normalize_remote(path);
        match st.nodes.get(&path) {
            Some(Node::Dir { .. }) if path == "/" => Err(TransferError::PermissionDenied(path)),
            Some(Node::Dir { .. }) => {
                if st.has_children(&path) {
                    return Err(TransferError::OperationFailed(format!(
                        "directory not empty: {path}"
                    )));
                }
                st.nodes.remove(&path);
                st.events.push(MemoryEvent::RemoveDir(path));
                Ok(())
            }
            Some(_) => Err(TransferError::NotADirectory(path)),
            None => Err(TransferError::NotFound(path)),
        }
    }

    fn create_dir(&self, path: &str) -> Result<()> {
        let mut st = self.state()?;
        let path = normalize_remote(path);
        if st.nodes.contains_key(&path) {
            return Err(TransferError::OperationFailed(format!("already exists: {path}")));
        }
        st.require_parent_dir(&path)?;
        st.nodes.insert(path.clone(), Node::Dir { mtime: now_secs(), perm: 0o755 });
        st.events.push(MemoryEvent::CreateDir(path));
        Ok(())
    }

    fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let mut st = self.state()?;
        let link = normalize_remote(link);
        if st.nodes.contains_key(&link) {
            return Err(TransferError::OperationFailed(format!("already exists: {link}")));
        }
        st.require_parent_dir(&link)?;
        st.nodes.insert(link.clone(), Node::Symlink { target: target.to_string() });
        st.events.push(MemoryEvent::Symlink { target: target.to_string(), link });
        Ok(())
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let st = self.state()?;
        let path = normalize_remote(path);
        match st.nodes.get(&path) {
            Some(Node::Symlink { target }) => Ok(target.clone()),
            Some(_) => Err(TransferError::OperationFailed(format!("not a symlink: {path}"))),
            None => Err(TransferError::NotFound(path)),
        }
    }

    fn run_command(&self, command: &str) -> Result<String> {
        let mut st = self.state()?;
        st.events.push(MemoryEvent::Command(command.to_string()));
        let Some(arg) = command.strip_prefix("readlink -f ") else {
            return Err(TransferError::Unsupported(format!("command: {command}")));
        };
        let arg = arg.trim();
        let unquoted = arg
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .map(|s| s.replace(r"'\''", "'"))
            .unwrap_or_else(|| arg.to_string());
        let resolved = st.resolve(&unquoted)?;
        Ok(format!("{resolved}\n"))
    }

    fn set_stat(&self, path: &str, attrs: &SetStat) -> Result<()> {
        let mut st = self.state()?;
        let real = st.resolve(path)?;
        match st.nodes.get_mut(&real) {
            Some(Node::File { mtime, perm, .. }) | Some(Node::Dir { mtime, perm }) => {
                if let Some(m) = attrs.mtime {
                    *mtime = m;
                }
                if let Some(p) = attrs.perm {
                    *perm = p;
                }
            }
            _ => return Err(TransferError::NotFound(real)),
        }
        st.events.push(MemoryEvent::SetStat(real));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn interrupt(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn close(&self) -> Result<()> {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.server.lock().events.push(MemoryEvent::Close);
        }
        Ok(())
    }
}

fn move_subtree(nodes: &mut BTreeMap<String, Node>, from: &str, to: &str) {
    let prefix = format!("{}/", from);
    let keys: Vec<String> =
        nodes.keys().filter(|k| *k == from || k.starts_with(&prefix)).cloned().collect();
    for k in keys {
        if let Some(node) = nodes.remove(&k) {
            let new_key = format!("{}{}", to, &k[from.len()..]);
            nodes.insert(new_key, node);
        }
    }
}

struct MemoryReader {
    server: MemoryServer,
    alive: Arc<AtomicBool>,
    path: String,
    pos: u64,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(dropped());
        }
        let mut st = self.server.lock();
        let available = match st.nodes.get(&self.path) {
            Some(Node::File { data, .. }) => data.len().saturating_sub(self.pos as usize),
            _ => return Err(io::Error::new(io::ErrorKind::NotFound, self.path.clone())),
        };
        let want = buf.len().min(available);
        if want == 0 {
            return Ok(0);
        }
        let n = st.meter(want).ok_or_else(dropped)?;
        if let Some(Node::File { data, .. }) = st.nodes.get(&self.path) {
            let start = self.pos as usize;
            buf[..n].copy_from_slice(&data[start..start + n]);
        }
        self.pos += n as u64;
        let hook = st.take_bytes_hook(n);
        drop(st);
        if let Some(hook) = hook {
            hook();
        }
        Ok(n)
    }
}

struct MemoryWriter {
    server: MemoryServer,
    alive: Arc<AtomicBool>,
    path: String,
    pos: u64,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(dropped());
        }
        let mut st = self.server.lock();
        let n = st.meter(buf.len()).ok_or_else(dropped)?;
        match st.nodes.get_mut(&self.path) {
            Some(Node::File { data, .. }) => {
                let start = self.pos as usize;
                if data.len() < start + n {
                    data.resize(start + n, 0);
                }
                data[start..start + n].copy_from_slice(&buf[..n]);
            }
            _ => return Err(io::Error::new(io::ErrorKind::NotFound, self.path.clone())),
        }
        self.pos += n as u64;
        let hook = st.take_bytes_hook(n);
        drop(st);
        if let Some(hook) = hook {
            hook();
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.alive.load(Ordering::SeqCst) { Ok(()) } else { Err(dropped()) }
    }
}
