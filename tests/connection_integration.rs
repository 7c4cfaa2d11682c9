use std::sync::Arc;

use skiff::auth::{AgentProbe, AuthenticationResolver};
use skiff::connection::{ConnectionManager, ConnectionState};
use skiff::known_hosts::{AcceptAll, HostKeyVerifier, KnownHostsStore};
use skiff::profile::{ConnectionProfile, ReconnectStrategy};
use skiff::prompt::{PromptRecord, ScriptedPrompter};
use skiff::remote::memory::MemoryServer;
use skiff::transfer::CancelToken;
use skiff::TransferError;

struct NoAgent;

impl AgentProbe for NoAgent {
    fn identities(&self) -> Result<Vec<String>, String> {
        Err("SSH_AUTH_SOCK not set".into())
    }
}

fn manager(server: &MemoryServer, host_keys: Arc<dyn HostKeyVerifier>) -> ConnectionManager {
    ConnectionManager::new(
        Arc::new(server.connector()),
        AuthenticationResolver::new(Arc::new(NoAgent), Arc::new(ScriptedPrompter::new())),
        host_keys,
    )
}

fn profile(password: Option<&str>) -> ConnectionProfile {
    let mut p = ConnectionProfile::new("files.example.net", 22, "deploy");
    p.password = password.map(str::to_string);
    p.reconnect_attempts = 2;
    p.reconnect_delay_secs = 1;
    p
}

fn transient() -> TransferError {
    TransferError::Connection { addr: "files.example.net:22".into(), reason: "connection refused".into() }
}

#[test]
fn initial_connect_retries_transient_failures() {
    let server = MemoryServer::new();
    server.fail_next_connects(vec![transient()]);
    let m = manager(&server, Arc::new(AcceptAll));
    m.connect(&profile(Some("pw")), &CancelToken::new()).unwrap();
    assert_eq!(server.connect_attempts(), 2);
    assert_eq!(m.state(), ConnectionState::Connected);
    // the initial connect is not a reconnect
    assert_eq!(m.reconnect_count(), 0);
}

#[test]
fn rejected_credentials_are_not_retried() {
    let server = MemoryServer::new();
    server.set_password(Some("correct horse"));
    let m = manager(&server, Arc::new(AcceptAll));
    let err = m.connect(&profile(Some("wrong")), &CancelToken::new()).unwrap_err();
    assert!(matches!(err, TransferError::AuthFailed { .. }), "{err:?}");
    assert_eq!(server.connect_attempts(), 1);
    assert_eq!(m.state(), ConnectionState::Disconnected);
}

#[test]
fn no_usable_method_fails_before_the_network() {
    let server = MemoryServer::new();
    let m = manager(&server, Arc::new(AcceptAll));
    let err = m.connect(&profile(None), &CancelToken::new()).unwrap_err();
    match err {
        TransferError::AuthUnavailable(u) => assert_eq!(u.reasons.len(), 3),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(server.connect_attempts(), 0);
}

#[test]
fn unknown_host_key_refusal_aborts_connect() {
    let server = MemoryServer::new();
    let prompter = Arc::new(ScriptedPrompter::new());
    prompter.push_host_key(false);
    let store = Arc::new(KnownHostsStore::open_in_memory(prompter.clone()).unwrap());
    let m = manager(&server, store.clone());
    let err = m.connect(&profile(Some("pw")), &CancelToken::new()).unwrap_err();
    assert!(matches!(err, TransferError::HostKeyRejected { port: 22, .. }), "{err:?}");
    assert!(store.entries().unwrap().is_empty());
    // trust failures are never retried
    assert_eq!(server.connect_attempts(), 1);
}

#[test]
fn approved_key_is_pinned_and_a_changed_key_warns() {
    let server = MemoryServer::new();
    let prompter = Arc::new(ScriptedPrompter::new());
    prompter.push_host_key(true);
    let store = Arc::new(KnownHostsStore::open_in_memory(prompter.clone()).unwrap());
    let m = manager(&server, store.clone());
    let cancel = CancelToken::new();
    m.connect(&profile(Some("pw")), &cancel).unwrap();
    let pinned = store.lookup("files.example.net", 22, "ssh-ed25519").unwrap().unwrap();
    assert_eq!(pinned.fingerprint, server.host_key_fingerprint());

    // same key: no prompt on reconnect
    m.connect(&profile(Some("pw")), &cancel).unwrap();
    assert_eq!(prompter.records().len(), 1);

    server.set_host_key("ssh-ed25519", b"someone-else");
    let err = m.connect(&profile(Some("pw")), &cancel).unwrap_err();
    assert!(matches!(err, TransferError::HostKeyRejected { .. }));
    match prompter.records().last() {
        Some(PromptRecord::HostKey(p)) => assert!(p.is_warning),
        other => panic!("unexpected {other:?}"),
    }
    // refused replacement keeps the old pin
    let still = store.lookup("files.example.net", 22, "ssh-ed25519").unwrap().unwrap();
    assert_eq!(still.fingerprint, pinned.fingerprint);
}

#[test]
fn dropped_session_is_replaced_transparently() {
    let server = MemoryServer::new();
    server.put_file("/srv/a.txt", b"hello");
    let m = manager(&server, Arc::new(AcceptAll));
    let cancel = CancelToken::new();
    m.connect(&profile(Some("pw")), &cancel).unwrap();
    server.drop_sessions();
    let names: Vec<String> = m.list_dir("/srv", &cancel).unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["a.txt".to_string()]);
    assert_eq!(m.reconnect_count(), 1);
    assert_eq!(m.state(), ConnectionState::Connected);
}

#[test]
fn exhausted_reconnect_surfaces_the_error() {
    let server = MemoryServer::new();
    let m = manager(&server, Arc::new(AcceptAll));
    let cancel = CancelToken::new();
    let mut p = profile(Some("pw"));
    p.reconnect_attempts = 1;
    m.connect(&p, &cancel).unwrap();
    server.fail_next_connects(vec![transient(), transient()]);
    server.drop_sessions();
    let err = m.stat("/", &cancel).unwrap_err();
    assert!(err.is_transient(), "{err:?}");
    assert_eq!(m.state(), ConnectionState::Disconnected);
    assert_eq!(m.reconnect_count(), 0);
}

#[test]
fn disabled_reconnect_fails_fast() {
    let server = MemoryServer::new();
    let m = manager(&server, Arc::new(AcceptAll));
    let cancel = CancelToken::new();
    let mut p = profile(Some("pw"));
    p.reconnect_strategy = ReconnectStrategy::None;
    server.fail_next_connects(vec![transient()]);
    assert!(m.connect(&p, &cancel).unwrap_err().is_transient());
    assert_eq!(server.connect_attempts(), 1);
}

#[test]
fn cancelled_token_stops_remote_calls() {
    let server = MemoryServer::new();
    let m = manager(&server, Arc::new(AcceptAll));
    let cancel = CancelToken::new();
    m.connect(&profile(Some("pw")), &cancel).unwrap();
    cancel.cancel();
    assert!(matches!(m.stat("/", &cancel), Err(TransferError::Cancelled)));
}
