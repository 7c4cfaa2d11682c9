//! Owns the single active remote session and makes every remote call
//! survive transient disconnects.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::auth::{AuthCredential, AuthenticationResolver};
use crate::error::{Result, TransferError};
use crate::known_hosts::HostKeyVerifier;
use crate::profile::{ConnectionProfile, ResiliencePolicy};
use crate::remote::{ConnectRequest, Connector, RemoteEntry, RemoteFs, RemoteStat, SetStat};
use crate::transfer::cancel::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

struct Slot {
    state: ConnectionState,
    profile: Option<ConnectionProfile>,
    policy: Option<ResiliencePolicy>,
    methods: Vec<AuthCredential>,
    session: Option<Arc<dyn RemoteFs>>,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    resolver: AuthenticationResolver,
    host_keys: Arc<dyn HostKeyVerifier>,
    // serializes connect / reconnect / disconnect
    gate: Mutex<()>,
    slot: Mutex<Slot>,
    // session torn down by a cancel hook; replaced on next use whatever the strategy
    interrupted: Mutex<Option<Arc<dyn RemoteFs>>>,
    reconnects: AtomicU32,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        resolver: AuthenticationResolver,
        host_keys: Arc<dyn HostKeyVerifier>,
    ) -> Self {
        Self {
            connector,
            resolver,
            host_keys,
            gate: Mutex::new(()),
            slot: Mutex::new(Slot {
                state: ConnectionState::Disconnected,
                profile: None,
                policy: None,
                methods: Vec::new(),
                session: None,
            }),
            interrupted: Mutex::new(None),
            reconnects: AtomicU32::new(0),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn interrupted(&self) -> MutexGuard<'_, Option<Arc<dyn RemoteFs>>> {
        self.interrupted.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        self.slot().state = state;
    }

    pub fn state(&self) -> ConnectionState {
        self.slot().state
    }

    pub fn policy(&self) -> Option<ResiliencePolicy> {
        self.slot().policy
    }

    pub fn profile(&self) -> Option<ConnectionProfile> {
        self.slot().profile.clone()
    }

    /// Reconnects performed since this manager was created.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|s| s.is_connected())
    }

    fn current(&self) -> Option<Arc<dyn RemoteFs>> {
        self.slot().session.clone()
    }

    /// Establish a session for `profile`, replacing any existing one.
    /// Transient failures are retried per the profile's policy; missing
    /// credentials, rejected authentication and untrusted host keys are not.
    pub fn connect(&self, profile: &ConnectionProfile, cancel: &CancelToken) -> Result<()> {
        let _gate = self.gate();
        let old = self.slot().session.take();
        if let Some(old) = old
            && let Err(e) = old.close()
        {
            debug!("[conn] closing previous session failed err={}", e);
        }
        self.interrupted().take();
        let policy = ResiliencePolicy::from_profile(profile);
        {
            let mut slot = self.slot();
            slot.state = ConnectionState::Connecting;
            slot.profile = Some(profile.clone());
            slot.policy = Some(policy);
            slot.methods.clear();
        }
        info!(
            "[conn] connecting addr={} user={} timeout={}s reconnect={:?}x{}",
            profile.addr(),
            profile.username,
            policy.timeout_secs,
            policy.strategy,
            policy.reconnect_attempts
        );
        let methods = match self.resolver.build_methods(profile) {
            Ok(m) => m,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        match self.open_with_retry(profile, &policy, &methods, cancel) {
            Ok(session) => {
                let mut slot = self.slot();
                slot.methods = methods;
                slot.session = Some(session);
                slot.state = ConnectionState::Connected;
                info!("[conn] connected addr={}", profile.addr());
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                warn!("[conn] connect failed addr={} err={}", profile.addr(), e);
                Err(e)
            }
        }
    }

    fn open_with_retry(
        &self,
        profile: &ConnectionProfile,
        policy: &ResiliencePolicy,
        methods: &[AuthCredential],
        cancel: &CancelToken,
    ) -> Result<Arc<dyn RemoteFs>> {
        let mut attempt = 0u32;
        loop {
            cancel.check()?;
            let request = ConnectRequest {
                profile,
                policy,
                methods,
                host_keys: self.host_keys.as_ref(),
            };
            match self.connector.open(&request) {
                Ok(session) => return Ok(session),
                Err(e)
                    if e.is_transient()
                        && policy.reconnect_enabled()
                        && attempt < policy.reconnect_attempts =>
                {
                    attempt += 1;
                    warn!(
                        "[conn] transient connect failure addr={} attempt={}/{} err={}",
                        profile.addr(),
                        attempt,
                        policy.reconnect_attempts,
                        e
                    );
                    cancel.sleep(policy.reconnect_delay())?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One connect attempt replacing the current session. Caller must hold
    /// the gate; retry budgeting belongs to the caller.
    fn reconnect_locked(&self, cancel: &CancelToken) -> Result<Arc<dyn RemoteFs>> {
        cancel.check()?;
        let (profile, policy, methods, old) = {
            let mut slot = self.slot();
            let (Some(profile), Some(policy)) = (slot.profile.clone(), slot.policy) else {
                return Err(TransferError::NotConnected);
            };
            slot.state = ConnectionState::Reconnecting;
            (profile, policy, slot.methods.clone(), slot.session.take())
        };
        if let Some(old) = old
            && let Err(e) = old.close()
        {
            debug!("[conn] closing stale session failed err={}", e);
        }
        let request = ConnectRequest {
            profile: &profile,
            policy: &policy,
            methods: &methods,
            host_keys: self.host_keys.as_ref(),
        };
        match self.connector.open(&request) {
            Ok(session) => {
                let n = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
                let mut slot = self.slot();
                slot.session = Some(session.clone());
                slot.state = ConnectionState::Connected;
                info!("[conn] reconnected addr={} total_reconnects={}", profile.addr(), n);
                Ok(session)
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                warn!("[conn] reconnect failed addr={} err={}", profile.addr(), e);
                Err(e)
            }
        }
    }

    fn live(&self) -> Option<Arc<dyn RemoteFs>> {
        self.current().filter(|s| s.is_connected())
    }

    /// Live session, reconnecting once when it died. Reconnects after a
    /// cancel interrupt always happen and are not charged to `attempts`;
    /// any other reconnect needs the policy to allow it and bumps `attempts`.
    fn acquire(&self, cancel: &CancelToken, attempts: &mut u32) -> Result<Arc<dyn RemoteFs>> {
        if let Some(s) = self.live() {
            return Ok(s);
        }
        let _gate = self.gate();
        if let Some(s) = self.live() {
            return Ok(s);
        }
        let policy = self.policy().ok_or(TransferError::NotConnected)?;
        let interrupted = self.interrupted().take();
        let after_cancel = match (self.current(), interrupted) {
            (Some(cur), Some(int)) => Arc::ptr_eq(&cur, &int),
            _ => false,
        };
        if after_cancel {
            debug!("[conn] replacing session interrupted by cancel");
            return self.reconnect_locked(cancel);
        }
        if !policy.reconnect_enabled() {
            let mut slot = self.slot();
            slot.session = None;
            slot.state = ConnectionState::Disconnected;
            return Err(TransferError::NotConnected);
        }
        *attempts += 1;
        self.reconnect_locked(cancel)
    }

    /// Live session, reconnecting once first when it died and the policy
    /// allows (or a cancel interrupted it).
    pub fn ensure_connected(&self, cancel: &CancelToken) -> Result<Arc<dyn RemoteFs>> {
        let mut attempts = 0;
        self.acquire(cancel, &mut attempts)
    }

    /// Drop `stale` so the next acquire opens a fresh session, unless another
    /// caller already replaced it.
    fn discard(&self, stale: &Arc<dyn RemoteFs>) {
        let taken = {
            let mut slot = self.slot();
            match &slot.session {
                Some(cur) if Arc::ptr_eq(cur, stale) => slot.session.take(),
                _ => None,
            }
        };
        if let Some(s) = taken
            && let Err(e) = s.close()
        {
            debug!("[conn] closing failed session err={}", e);
        }
    }

    /// Run `action` against the live session. A transient failure forces a
    /// reconnect and re-runs the action. Every reconnect made on the way,
    /// including one for a session that died before the call, counts against
    /// the policy's attempts.
    pub fn execute_with_reconnect_retry<T, F>(
        &self,
        op: &str,
        cancel: &CancelToken,
        mut action: F,
    ) -> Result<T>
    where
        F: FnMut(&dyn RemoteFs) -> Result<T>,
    {
        let mut attempts = 0u32;
        loop {
            cancel.check()?;
            let (err, stale) = match self.acquire(cancel, &mut attempts) {
                Ok(session) => match action(session.as_ref()) {
                    Ok(v) => return Ok(v),
                    Err(_) if cancel.is_cancelled() => return Err(TransferError::Cancelled),
                    Err(e) => (e, Some(session)),
                },
                Err(e) => (e, None),
            };
            let Some(policy) = self.policy() else {
                return Err(err);
            };
            if !(err.is_transient()
                && policy.reconnect_enabled()
                && attempts < policy.reconnect_attempts)
            {
                return Err(err);
            }
            warn!(
                "[conn] transient failure op={} attempt={}/{} err={}",
                op,
                attempts + 1,
                policy.reconnect_attempts,
                err
            );
            match stale {
                Some(session) => self.discard(&session),
                // the reconnect itself failed
                None => cancel.sleep(policy.reconnect_delay())?,
            }
        }
    }

    /// Best-effort graceful close; local state is cleared regardless.
    pub fn disconnect(&self) {
        let _gate = self.gate();
        let session = {
            let mut slot = self.slot();
            slot.state = ConnectionState::Disconnected;
            slot.methods.clear();
            slot.policy = None;
            slot.profile = None;
            slot.session.take()
        };
        self.interrupted().take();
        if let Some(s) = session
            && let Err(e) = s.close()
        {
            debug!("[conn] close failed err={}", e);
        }
        info!("[conn] disconnected");
    }

    /// Force-close the live transport so blocked I/O returns now. Used by
    /// cancellation hooks; never waits on the gate.
    pub fn interrupt(&self) {
        if let Some(s) = self.current() {
            *self.interrupted() = Some(s.clone());
            s.interrupt();
        }
    }

    // ---- wrapped remote calls ----

    pub fn list_dir(&self, path: &str, cancel: &CancelToken) -> Result<Vec<RemoteEntry>> {
        self.execute_with_reconnect_retry("list_dir", cancel, |fs| fs.list_dir(path))
    }

    pub fn stat(&self, path: &str, cancel: &CancelToken) -> Result<RemoteStat> {
        self.execute_with_reconnect_retry("stat", cancel, |fs| fs.stat(path))
    }

    pub fn lstat(&self, path: &str, cancel: &CancelToken) -> Result<RemoteStat> {
        self.execute_with_reconnect_retry("lstat", cancel, |fs| fs.lstat(path))
    }

    pub fn exists(&self, path: &str, cancel: &CancelToken) -> Result<bool> {
        self.execute_with_reconnect_retry("exists", cancel, |fs| fs.exists(path))
    }

    pub fn rename(&self, from: &str, to: &str, cancel: &CancelToken) -> Result<()> {
        self.execute_with_reconnect_retry("rename", cancel, |fs| fs.rename(from, to))
    }

    pub fn remove_file(&self, path: &str, cancel: &CancelToken) -> Result<()> {
        self.execute_with_reconnect_retry("remove_file", cancel, |fs| fs.remove_file(path))
    }

    pub fn remove_dir(&self, path: &str, cancel: &CancelToken) -> Result<()> {
        self.execute_with_reconnect_retry("remove_dir", cancel, |fs| fs.remove_dir(path))
    }

    pub fn create_dir(&self, path: &str, cancel: &CancelToken) -> Result<()> {
        self.execute_with_reconnect_retry("create_dir", cancel, |fs| fs.create_dir(path))
    }

    pub fn symlink(&self, target: &str, link: &str, cancel: &CancelToken) -> Result<()> {
        self.execute_with_reconnect_retry("symlink", cancel, |fs| fs.symlink(target, link))
    }

    pub fn read_link(&self, path: &str, cancel: &CancelToken) -> Result<String> {
        self.execute_with_reconnect_retry("read_link", cancel, |fs| fs.read_link(path))
    }

    pub fn run_command(&self, command: &str, cancel: &CancelToken) -> Result<String> {
        self.execute_with_reconnect_retry("run_command", cancel, |fs| fs.run_command(command))
    }

    pub fn set_stat(&self, path: &str, attrs: &SetStat, cancel: &CancelToken) -> Result<()> {
        self.execute_with_reconnect_retry("set_stat", cancel, |fs| fs.set_stat(path, attrs))
    }

    pub fn supports_atomic_overwrite_rename(&self, cancel: &CancelToken) -> Result<bool> {
        self.execute_with_reconnect_retry("capabilities", cancel, |fs| {
            Ok(fs.supports_atomic_overwrite_rename())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AgentProbe;
    use crate::known_hosts::AcceptAll;
    use crate::profile::ReconnectStrategy;
    use crate::prompt::ScriptedPrompter;
    use crate::remote::memory::MemoryServer;

    struct NoAgent;

    impl AgentProbe for NoAgent {
        fn identities(&self) -> std::result::Result<Vec<String>, String> {
            Err("no agent".into())
        }
    }

    fn manager(server: &MemoryServer) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(server.connector()),
            AuthenticationResolver::new(Arc::new(NoAgent), Arc::new(ScriptedPrompter::new())),
            Arc::new(AcceptAll),
        )
    }

    fn profile() -> ConnectionProfile {
        let mut p = ConnectionProfile::new("mem", 22, "u");
        p.password = Some("pw".into());
        p
    }

    #[test]
    fn dead_session_is_replaced_before_the_next_call() {
        let server = MemoryServer::new();
        server.put_file("/a", b"1");
        let m = manager(&server);
        let cancel = CancelToken::new();
        m.connect(&profile(), &cancel).unwrap();
        assert_eq!(m.state(), ConnectionState::Connected);
        server.drop_sessions();
        assert_eq!(m.stat("/a", &cancel).unwrap().size, 1);
        assert_eq!(m.reconnect_count(), 1);
        assert_eq!(server.connects(), 2);
    }

    #[test]
    fn reconnect_disabled_reports_not_connected() {
        let server = MemoryServer::new();
        let m = manager(&server);
        let cancel = CancelToken::new();
        let mut p = profile();
        p.reconnect_strategy = ReconnectStrategy::None;
        m.connect(&p, &cancel).unwrap();
        server.drop_sessions();
        assert!(matches!(m.stat("/", &cancel), Err(TransferError::NotConnected)));
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn interrupted_session_is_replaced_even_without_reconnect() {
        let server = MemoryServer::new();
        server.put_file("/a", b"1");
        let m = manager(&server);
        let cancel = CancelToken::new();
        let mut p = profile();
        p.reconnect_strategy = ReconnectStrategy::None;
        m.connect(&p, &cancel).unwrap();
        m.interrupt();
        assert!(!m.is_connected());
        assert_eq!(m.stat("/a", &cancel).unwrap().size, 1);
        assert_eq!(m.state(), ConnectionState::Connected);
        // an ordinary drop still is not reconnected
        server.drop_sessions();
        assert!(matches!(m.stat("/a", &cancel), Err(TransferError::NotConnected)));
    }

    #[test]
    fn one_operation_stays_within_the_reconnect_budget() {
        let server = MemoryServer::new();
        let m = manager(&server);
        let cancel = CancelToken::new();
        let mut p = profile();
        p.reconnect_attempts = 2;
        p.reconnect_delay_secs = 1;
        m.connect(&p, &cancel).unwrap();
        let refused = || TransferError::Connection { addr: "mem:22".into(), reason: "refused".into() };
        server.fail_next_connects((0..6).map(|_| refused()).collect());
        server.drop_sessions();
        assert!(m.stat("/", &cancel).unwrap_err().is_transient());
        // initial connect plus two reconnect attempts
        assert_eq!(server.connect_attempts(), 3);
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn failing_call_on_a_live_session_reconnects_once_per_attempt() {
        let server = MemoryServer::new();
        server.put_file("/f", &[1u8; 64]);
        let m = manager(&server);
        let cancel = CancelToken::new();
        m.connect(&profile(), &cancel).unwrap();
        let mut calls = 0;
        let got = m
            .execute_with_reconnect_retry("read", &cancel, |fs| {
                calls += 1;
                if calls < 3 {
                    return Err(TransferError::Timeout("/f".into()));
                }
                fs.stat("/f")
            })
            .unwrap();
        assert_eq!(got.size, 64);
        assert_eq!(m.reconnect_count(), 2);
        assert_eq!(server.connect_attempts(), 3);
    }

    #[test]
    fn non_transient_errors_pass_through() {
        let server = MemoryServer::new();
        let m = manager(&server);
        let cancel = CancelToken::new();
        m.connect(&profile(), &cancel).unwrap();
        assert!(matches!(m.stat("/missing", &cancel), Err(TransferError::NotFound(_))));
        assert_eq!(m.reconnect_count(), 0);
    }

    #[test]
    fn disconnect_clears_state() {
        let server = MemoryServer::new();
        let m = manager(&server);
        let cancel = CancelToken::new();
        m.connect(&profile(), &cancel).unwrap();
        m.disconnect();
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.policy().is_none());
        assert!(matches!(m.stat("/", &cancel), Err(TransferError::NotConnected)));
    }
}
