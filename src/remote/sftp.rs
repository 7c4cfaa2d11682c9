//! libssh2-backed remote filesystem.
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ssh2::{ErrorCode, FileStat, HostKeyType, OpenFlags, OpenType, Session, Sftp};
use tracing::{debug, warn};

use super::{ConnectRequest, Connector, RemoteEntry, RemoteFs, RemoteStat, SetStat};
use crate::auth::{AgentProbe, AuthCredential};
use crate::error::{Result, TransferError};
use crate::known_hosts::fingerprint_sha256;
use crate::path::join_remote;

// libssh2 session error codes
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;
// SFTP status codes
const SSH_FX_NO_SUCH_FILE: i32 = 2;
const SSH_FX_PERMISSION_DENIED: i32 = 3;
const SSH_FX_NO_CONNECTION: i32 = 6;
const SSH_FX_CONNECTION_LOST: i32 = 7;
const SSH_FX_NO_SUCH_PATH: i32 = 10;

/// Map a libssh2 error onto the crate taxonomy; `ctx` names the path or
/// operation.
pub fn map_ssh_error(e: &ssh2::Error, ctx: &str) -> TransferError {
    match e.code() {
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => {
            TransferError::Timeout(format!("{ctx}: {}", e.message()))
        }
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND | LIBSSH2_ERROR_SOCKET_DISCONNECT | LIBSSH2_ERROR_SOCKET_RECV,
        ) => TransferError::Connection { addr: ctx.to_string(), reason: e.message().to_string() },
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED) => {
            TransferError::AuthFailed { addr: ctx.to_string(), attempted: e.message().to_string() }
        }
        ErrorCode::SFTP(SSH_FX_NO_SUCH_FILE | SSH_FX_NO_SUCH_PATH) => {
            TransferError::NotFound(ctx.to_string())
        }
        ErrorCode::SFTP(SSH_FX_PERMISSION_DENIED) => TransferError::PermissionDenied(ctx.to_string()),
        ErrorCode::SFTP(SSH_FX_NO_CONNECTION | SSH_FX_CONNECTION_LOST) => {
            TransferError::SessionClosed(format!("{ctx}: {}", e.message()))
        }
        _ => TransferError::OperationFailed(format!("{ctx}: {}", e.message())),
    }
}

fn algorithm_name(kind: HostKeyType) -> &'static str {
    match kind {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
}

fn to_remote_stat(st: &FileStat) -> RemoteStat {
    RemoteStat {
        size: st.size.unwrap_or(0),
        is_dir: st.is_dir(),
        is_symlink: st.file_type().is_symlink(),
        mtime: st.mtime,
        uid: st.uid,
        gid: st.gid,
        perm: st.perm,
    }
}

/// 创建并配置 TCP 连接
fn create_tcp_connection(addr: &str, timeout: std::time::Duration) -> Result<TcpStream> {
    let conn_err = |reason: String| TransferError::Connection { addr: addr.to_string(), reason };
    let sock = addr
        .to_socket_addrs()
        .map_err(|e| conn_err(e.to_string()))?
        .next()
        .ok_or_else(|| conn_err("no address resolved".to_string()))?;
    let tcp = TcpStream::connect_timeout(&sock, timeout).map_err(|e| TransferError::from_io(&e, addr))?;
    let _ = tcp.set_read_timeout(Some(timeout));
    let _ = tcp.set_write_timeout(Some(timeout));
    Ok(tcp)
}

/// Opens [`Ssh2Fs`] sessions.
#[derive(Default)]
pub struct Ssh2Connector;

impl Connector for Ssh2Connector {
    fn open(&self, request: &ConnectRequest<'_>) -> Result<Arc<dyn RemoteFs>> {
        let profile = request.profile;
        let policy = request.policy;
        let addr = profile.addr();
        let tcp = create_tcp_connection(&addr, policy.timeout())?;
        let control = tcp.try_clone().map_err(|e| TransferError::from_io(&e, &addr))?;

        let mut sess = Session::new().map_err(|e| map_ssh_error(&e, &addr))?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout((policy.timeout_secs * 1000).min(u32::MAX as u64) as u32);
        sess.handshake().map_err(|e| map_ssh_error(&e, &addr))?;

        // 主机密钥校验必须在认证之前
        let (key, kind) = sess.host_key().ok_or_else(|| TransferError::Connection {
            addr: addr.clone(),
            reason: "server presented no host key".to_string(),
        })?;
        let algorithm = algorithm_name(kind);
        let fingerprint = fingerprint_sha256(key);
        if !request.host_keys.verify(&profile.host, profile.port, algorithm, &fingerprint) {
            let _ = sess.disconnect(None, "host key rejected", None);
            return Err(TransferError::HostKeyRejected {
                host: profile.host.clone(),
                port: profile.port,
                algorithm: algorithm.to_string(),
            });
        }

        let mut attempted = Vec::new();
        for method in request.methods {
            attempted.push(method.kind().to_string());
            let res = match method {
                AuthCredential::Agent { .. } => sess.userauth_agent(&profile.username),
                AuthCredential::PrivateKey { path, passphrase } => sess.userauth_pubkey_file(
                    &profile.username,
                    None,
                    path,
                    passphrase.as_deref(),
                ),
                AuthCredential::Password(pw) => sess.userauth_password(&profile.username, pw),
            };
            if let Err(e) = res {
                debug!("[auth] method rejected kind={} err={}", method.kind(), e.message());
            }
            if sess.authenticated() {
                debug!("[auth] authenticated kind={} addr={}", method.kind(), addr);
                break;
            }
        }
        if !sess.authenticated() {
            let _ = sess.disconnect(None, "authentication failed", None);
            return Err(TransferError::AuthFailed { addr, attempted: attempted.join(", ") });
        }

        if policy.keepalive_secs > 0 {
            sess.set_keepalive(true, policy.keepalive_secs as u32);
        }
        let sftp = sess.sftp().map_err(|e| map_ssh_error(&e, &addr))?;
        Ok(Arc::new(Ssh2Fs {
            addr,
            session: Mutex::new(sess),
            sftp: Mutex::new(sftp),
            control,
            alive: AtomicBool::new(true),
            keepalive: policy.keepalive_secs > 0,
        }))
    }
}

pub struct Ssh2Fs {
    addr: String,
    session: Mutex<Session>,
    sftp: Mutex<Sftp>,
    // cloned socket; shutting it down unblocks pending reads and writes
    control: TcpStream,
    alive: AtomicBool,
    keepalive: bool,
}

impl Ssh2Fs {
    fn sftp(&self) -> Result<MutexGuard<'_, Sftp>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransferError::SessionClosed(self.addr.clone()));
        }
        Ok(self.sftp.lock().unwrap_or_else(|p| p.into_inner()))
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn track<T>(&self, res: std::result::Result<T, ssh2::Error>, ctx: &str) -> Result<T> {
        res.map_err(|e| {
            let mapped = map_ssh_error(&e, ctx);
            if matches!(mapped, TransferError::SessionClosed(_) | TransferError::Connection { .. }) {
                self.alive.store(false, Ordering::SeqCst);
            }
            mapped
        })
    }
}

impl RemoteFs for Ssh2Fs {
    fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let entries = {
            let sftp = self.sftp()?;
            self.track(sftp.readdir(Path::new(path)), path)?
        };
        let mut out: Vec<RemoteEntry> = entries
            .into_iter()
            .filter_map(|(p, st)| {
                let name = p.file_name()?.to_string_lossy().to_string();
                if name == "." || name == ".." {
                    return None;
                }
                Some(RemoteEntry { path: join_remote(path, &name), name, stat: to_remote_stat(&st) })
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn stat(&self, path: &str) -> Result<RemoteStat> {
        let sftp = self.sftp()?;
        self.track(sftp.stat(Path::new(path)), path).map(|s| to_remote_stat(&s))
    }

    fn lstat(&self, path: &str) -> Result<RemoteStat> {
        let sftp = self.sftp()?;
        self.track(sftp.lstat(Path::new(path)), path).map(|s| to_remote_stat(&s))
    }

    fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn Read + Send>> {
        let sftp = self.sftp()?;
        let mut f = self.track(sftp.open(Path::new(path)), path)?;
        if offset > 0 {
            f.seek(SeekFrom::Start(offset)).map_err(|e| TransferError::from_io(&e, path))?;
        }
        Ok(Box::new(f))
    }

    fn open_write(&self, path: &str, offset: u64) -> Result<Box<dyn Write + Send>> {
        let sftp = self.sftp()?;
        let flags = if offset == 0 {
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE
        } else {
            OpenFlags::WRITE
        };
        let mut f =
            self.track(sftp.open_mode(Path::new(path), flags, 0o644, OpenType::File), path)?;
        if offset > 0 {
            f.seek(SeekFrom::Start(offset)).map_err(|e| TransferError::from_io(&e, path))?;
        }
        Ok(Box::new(f))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let sftp = self.sftp()?;
        self.track(sftp.rename(Path::new(from), Path::new(to), None), from)
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        let sftp = self.sftp()?;
        self.track(sftp.unlink(Path::new(path)), path)
    }

    fn remove_dir(&self, path: &str) -> Result<()> {
        let sftp = self.sftp()?;
        self.track(sftp.rmdir(Path::new(path)), path)
    }

    fn create_dir(&self, path: &str) -> Result<()> {
        let sftp = self.sftp()?;
        self.track(sftp.mkdir(Path::new(path), 0o755), path)
    }

    fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let sftp = self.sftp()?;
        self.track(sftp.symlink(Path::new(link), Path::new(target)), link)
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let sftp = self.sftp()?;
        self.track(sftp.readlink(Path::new(path)), path)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }

    fn run_command(&self, command: &str) -> Result<String> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransferError::SessionClosed(self.addr.clone()));
        }
        let sess = self.session();
        let mut channel = self.track(sess.channel_session(), "exec")?;
        self.track(channel.exec(command), "exec")?;
        let mut stdout = String::new();
        channel.read_to_string(&mut stdout).map_err(|e| TransferError::from_io(&e, "exec"))?;
        let mut stderr = String::new();
        let _ = channel.stderr().read_to_string(&mut stderr);
        let _ = channel.wait_close();
        match channel.exit_status() {
            Ok(0) => Ok(stdout),
            Ok(code) => Err(TransferError::OperationFailed(format!(
                "remote command exited with {code}: {}",
                stderr.trim()
            ))),
            Err(e) => Err(map_ssh_error(&e, "exec")),
        }
    }

    fn set_stat(&self, path: &str, attrs: &SetStat) -> Result<()> {
        let sftp = self.sftp()?;
        let stat = FileStat {
            size: None,
            uid: attrs.uid,
            gid: attrs.gid,
            perm: attrs.perm,
            atime: attrs.mtime,
            mtime: attrs.mtime,
        };
        self.track(sftp.setstat(Path::new(path), stat), path)
    }

    fn is_connected(&self) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        if self.keepalive
            && let Err(e) = self.session().keepalive_send()
        {
            warn!("[conn] keepalive failed addr={} err={}", self.addr, e.message());
            self.alive.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn interrupt(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.control.shutdown(Shutdown::Both);
    }

    fn close(&self) -> Result<()> {
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        let res = if was_alive {
            self.session()
                .disconnect(None, "closing", None)
                .map_err(|e| map_ssh_error(&e, &self.addr))
        } else {
            Ok(())
        };
        let _ = self.control.shutdown(Shutdown::Both);
        res
    }
}

/// Queries the running ssh-agent through libssh2.
#[derive(Default)]
pub struct Ssh2AgentProbe;

impl AgentProbe for Ssh2AgentProbe {
    fn identities(&self) -> std::result::Result<Vec<String>, String> {
        let sess = Session::new().map_err(|e| e.message().to_string())?;
        let mut agent = sess.agent().map_err(|e| e.message().to_string())?;
        agent.connect().map_err(|e| format!("agent not reachable: {}", e.message()))?;
        agent.list_identities().map_err(|e| e.message().to_string())?;
        let ids = agent
            .identities()
            .map_err(|e| e.message().to_string())?
            .iter()
            .map(|k| k.comment().to_string())
            .collect();
        let _ = agent.disconnect();
        Ok(ids)
    }
}
