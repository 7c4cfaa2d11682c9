use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use skiff::auth::{AgentProbe, AuthenticationResolver};
use skiff::connection::ConnectionManager;
use skiff::engine::TransferEngine;
use skiff::known_hosts::AcceptAll;
use skiff::profile::{ConnectionProfile, ReconnectStrategy};
use skiff::prompt::{
    ConflictChoice, ConflictDecision, ConflictRequest, HostKeyPrompt, Prompter, ScriptedPrompter,
    SymlinkChoice,
};
use skiff::queue::{
    DeleteRequest, DownloadRequest, JobDefinition, JobSnapshot, JobState, JobWork, TransferQueue,
    UploadRequest,
};
use skiff::remote::memory::{MemoryEvent, MemoryServer};
use skiff::transfer::executor::{part_download_path, temp_upload_path};
use skiff::transfer::{CancelToken, TransferItem, TransferOptions};
use skiff::util::{set_backoff_ms, system_time_secs};

struct NoAgent;

impl AgentProbe for NoAgent {
    fn identities(&self) -> Result<Vec<String>, String> {
        Err("no agent".into())
    }
}

struct Harness {
    server: MemoryServer,
    conn: Arc<ConnectionManager>,
    queue: Arc<TransferQueue>,
}

fn harness(prompter: Arc<dyn Prompter>, options: TransferOptions) -> Harness {
    harness_with(prompter, options, |_| {})
}

fn harness_with(
    prompter: Arc<dyn Prompter>,
    options: TransferOptions,
    tweak: impl FnOnce(&mut ConnectionProfile),
) -> Harness {
    set_backoff_ms(1);
    let server = MemoryServer::new();
    let conn = Arc::new(ConnectionManager::new(
        Arc::new(server.connector()),
        AuthenticationResolver::new(Arc::new(NoAgent), Arc::new(ScriptedPrompter::new())),
        Arc::new(AcceptAll),
    ));
    let mut p = ConnectionProfile::new("mem", 22, "u");
    p.password = Some("pw".into());
    tweak(&mut p);
    conn.connect(&p, &CancelToken::new()).unwrap();
    let engine = Arc::new(TransferEngine::new(conn.clone(), prompter, options));
    Harness { server, conn, queue: Arc::new(TransferQueue::new(engine)) }
}

fn run(h: &Harness, def: JobDefinition) -> JobSnapshot {
    let id = h.queue.submit(def);
    assert!(h.queue.wait_idle(Some(Duration::from_secs(30))), "queue did not drain");
    h.queue.job(id).unwrap()
}

fn upload(sources: Vec<PathBuf>, remote_dir: &str) -> JobDefinition {
    JobDefinition::new("upload", JobWork::Upload(UploadRequest { sources, remote_dir: remote_dir.into() }))
}

fn download(sources: &[&str], local_dir: &Path) -> JobDefinition {
    JobDefinition::new(
        "download",
        JobWork::Download(DownloadRequest {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            local_dir: local_dir.to_path_buf(),
        }),
    )
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn no_verify() -> TransferOptions {
    TransferOptions { verify: false, chunk_size: 4096, ..Default::default() }
}

fn part_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.to_string_lossy().ends_with(".skiff-part"))
        .collect()
}

fn download_item(server: &MemoryServer, remote: &str, local: PathBuf, size: u64) -> TransferItem {
    TransferItem {
        display_name: local.file_name().unwrap().to_string_lossy().to_string(),
        local,
        remote: remote.into(),
        size,
        mtime: server.mtime(remote),
    }
}

fn leftovers(server: &MemoryServer) -> Vec<String> {
    server
        .paths()
        .into_iter()
        .filter(|p| p.ends_with(".skiff-tmp") || p.ends_with(".skiff-bak"))
        .collect()
}

#[test]
fn dropped_download_resumes_from_written_offset() {
    let h = harness(Arc::new(ScriptedPrompter::new()), no_verify());
    let data = pattern(100_000);
    h.server.put_file("/data/big.bin", &data);
    h.server.drop_after_bytes(10_000);
    let tmp = tempfile::tempdir().unwrap();

    let snap = run(&h, download(&["/data/big.bin"], tmp.path()));
    assert_eq!(snap.state, JobState::Completed, "{:?}", snap.error);
    assert_eq!(snap.progress, 100);
    assert_eq!(fs::read(tmp.path().join("big.bin")).unwrap(), data);
    assert!(part_files(tmp.path()).is_empty());
    assert_eq!(h.conn.reconnect_count(), 1);

    let offsets: Vec<u64> = h
        .server
        .events()
        .into_iter()
        .filter_map(|e| match e {
            MemoryEvent::OpenRead { offset, .. } => Some(offset),
            _ => None,
        })
        .collect();
    assert_eq!(offsets, vec![0, 10_000]);
}

#[test]
fn dropped_upload_continues_the_temp_file() {
    let h = harness(Arc::new(ScriptedPrompter::new()), TransferOptions { chunk_size: 4096, ..Default::default() });
    h.server.mkdir_all("/srv");
    let tmp = tempfile::tempdir().unwrap();
    let local = tmp.path().join("payload.bin");
    let data = pattern(50_000);
    fs::write(&local, &data).unwrap();
    h.server.drop_after_bytes(8_192);

    let snap = run(&h, upload(vec![local], "/srv"));
    assert_eq!(snap.state, JobState::Completed, "{:?}", snap.error);
    assert_eq!(h.server.read_file("/srv/payload.bin").unwrap(), data);
    let writes: Vec<(String, u64)> = h
        .server
        .events()
        .into_iter()
        .filter_map(|e| match e {
            MemoryEvent::OpenWrite { path, offset } => Some((path, offset)),
            _ => None,
        })
        .collect();
    assert_eq!(writes.len(), 2);
    assert!(writes.iter().all(|(p, _)| p.ends_with(".skiff-tmp")));
    assert_eq!(writes[1].1, 8_192);
    assert!(snap.status.contains("1 hashed"), "{}", snap.status);
    assert!(leftovers(&h.server).is_empty());
}

#[test]
fn upload_never_writes_the_final_name_and_swaps_existing() {
    let prompter = Arc::new(ScriptedPrompter::new());
    prompter.push_conflict(ConflictDecision::once(ConflictChoice::Overwrite));
    let h = harness(prompter, TransferOptions::default());
    h.server.put_file("/srv/app.bin", b"old build");
    let tmp = tempfile::tempdir().unwrap();
    let local = tmp.path().join("app.bin");
    fs::write(&local, pattern(20_000)).unwrap();

    let snap = run(&h, upload(vec![local], "/srv"));
    assert_eq!(snap.state, JobState::Completed, "{:?}", snap.error);
    assert_eq!(h.server.read_file("/srv/app.bin").unwrap(), pattern(20_000));

    let events = h.server.events();
    assert!(!events.iter().any(|e| matches!(e, MemoryEvent::OpenWrite { path, .. } if path == "/srv/app.bin")));
    let renames: Vec<(String, String)> = events
        .iter()
        .filter_map(|e| match e {
            MemoryEvent::Rename { from, to } => Some((from.clone(), to.clone())),
            _ => None,
        })
        .collect();
    // original moved aside, then the temp moved in
    assert_eq!(renames.len(), 2);
    assert_eq!(renames[0].0, "/srv/app.bin");
    assert!(renames[0].1.ends_with(".skiff-bak"));
    assert!(renames[1].0.ends_with(".skiff-tmp"));
    assert_eq!(renames[1].1, "/srv/app.bin");
    assert!(leftovers(&h.server).is_empty());
}

#[test]
fn failed_swap_restores_the_original() {
    let prompter = Arc::new(ScriptedPrompter::new());
    prompter.push_conflict(ConflictDecision::once(ConflictChoice::Overwrite));
    let h = harness(prompter, TransferOptions::default());
    h.server.put_file("/srv/app.bin", b"old build");
    h.server.fail_rename_to("/srv/app.bin");
    let tmp = tempfile::tempdir().unwrap();
    let local = tmp.path().join("app.bin");
    fs::write(&local, b"new build").unwrap();

    let snap = run(&h, upload(vec![local], "/srv"));
    assert_eq!(snap.state, JobState::Failed);
    assert!(snap.retryable);
    assert_eq!(h.server.read_file("/srv/app.bin").unwrap(), b"old build");
    // temp discarded, backup renamed back
    assert!(leftovers(&h.server).is_empty());
}

#[test]
fn atomic_rename_replaces_in_one_step() {
    let prompter = Arc::new(ScriptedPrompter::new());
    prompter.push_conflict(ConflictDecision::once(ConflictChoice::Overwrite));
    let h = harness(prompter, TransferOptions::default());
    h.server.set_atomic_rename(true);
    h.server.put_file("/srv/app.bin", b"old build");
    let tmp = tempfile::tempdir().unwrap();
    let local = tmp.path().join("app.bin");
    fs::write(&local, b"new build").unwrap();

    let snap = run(&h, upload(vec![local], "/srv"));
    assert_eq!(snap.state, JobState::Completed, "{:?}", snap.error);
    let renames = h.server.events().into_iter().filter(|e| matches!(e, MemoryEvent::Rename { .. })).count();
    assert_eq!(renames, 1);
    assert_eq!(h.server.read_file("/srv/app.bin").unwrap(), b"new build");
}

#[test]
fn partial_temp_from_an_earlier_run_is_resumed() {
    let h = harness(Arc::new(ScriptedPrompter::new()), no_verify());
    h.server.mkdir_all("/srv");
    let tmp = tempfile::tempdir().unwrap();
    let local = tmp.path().join("video.mp4");
    let data = pattern(30_000);
    fs::write(&local, &data).unwrap();
    let md = fs::metadata(&local).unwrap();
    let item = TransferItem {
        local: local.clone(),
        remote: "/srv/video.mp4".into(),
        display_name: "video.mp4".into(),
        size: md.len(),
        mtime: md.modified().ok().and_then(system_time_secs),
    };
    h.server.put_file(&temp_upload_path(&item), &data[..12_000]);

    let snap = run(&h, upload(vec![local], "/srv"));
    assert_eq!(snap.state, JobState::Completed, "{:?}", snap.error);
    assert!(snap.status.contains("1 resumed"), "{}", snap.status);
    assert_eq!(h.server.read_file("/srv/video.mp4").unwrap(), data);
    assert!(h.server.events().contains(&MemoryEvent::OpenWrite { path: temp_upload_path(&item), offset: 12_000 }));
}

#[test]
fn partial_download_is_resumed() {
    let h = harness(Arc::new(ScriptedPrompter::new()), TransferOptions::default());
    let data = pattern(40_000);
    h.server.put_file("/data/dump.sql", &data);
    let tmp = tempfile::tempdir().unwrap();
    let item = download_item(&h.server, "/data/dump.sql", tmp.path().join("dump.sql"), 40_000);
    fs::write(part_download_path(&item), &data[..25_000]).unwrap();

    let snap = run(&h, download(&["/data/dump.sql"], tmp.path()));
    assert_eq!(snap.state, JobState::Completed, "{:?}", snap.error);
    assert!(snap.status.contains("1 resumed"), "{}", snap.status);
    assert_eq!(fs::read(tmp.path().join("dump.sql")).unwrap(), data);
    assert!(h.server.events().contains(&MemoryEvent::OpenRead { path: "/data/dump.sql".into(), offset: 25_000 }));
}

#[test]
fn part_from_another_version_of_the_file_is_not_continued() {
    let h = harness(Arc::new(ScriptedPrompter::new()), no_verify());
    let data = pattern(40_000);
    h.server.put_file_with_mtime("/data/dump.sql", &data, 1_700_000_500);
    let tmp = tempfile::tempdir().unwrap();
    // left over from yesterday's dump: same name, different content
    let mut old = download_item(&h.server, "/data/dump.sql", tmp.path().join("dump.sql"), 40_000);
    old.mtime = Some(1_600_000_000);
    fs::write(part_download_path(&old), vec![0xAAu8; 25_000]).unwrap();

    let snap = run(&h, download(&["/data/dump.sql"], tmp.path()));
    assert_eq!(snap.state, JobState::Completed, "{:?}", snap.error);
    assert!(!snap.status.contains("resumed"), "{}", snap.status);
    assert_eq!(fs::read(tmp.path().join("dump.sql")).unwrap(), data);
    assert!(part_files(tmp.path()).is_empty());
    assert!(h.server.events().contains(&MemoryEvent::OpenRead { path: "/data/dump.sql".into(), offset: 0 }));
}

#[test]
fn cancel_mid_upload_removes_the_temp_and_the_next_job_runs() {
    let h = harness_with(Arc::new(ScriptedPrompter::new()), no_verify(), |p| {
        p.reconnect_strategy = ReconnectStrategy::None;
    });
    h.server.mkdir_all("/srv");
    h.server.put_file("/srv/old.log", b"stale");
    let tmp = tempfile::tempdir().unwrap();
    let local = tmp.path().join("big.bin");
    fs::write(&local, pattern(200_000)).unwrap();
    let q = h.queue.clone();
    h.server.on_bytes(16_384, move || {
        q.cancel_current();
    });

    let first = h.queue.submit(upload(vec![local], "/srv"));
    let second = h.queue.submit(JobDefinition::new(
        "rm",
        JobWork::Delete(DeleteRequest { paths: vec!["/srv/old.log".into()] }),
    ));
    assert!(h.queue.wait_idle(Some(Duration::from_secs(30))));

    assert_eq!(h.queue.job(first).unwrap().state, JobState::Cancelled);
    let after = h.queue.job(second).unwrap();
    assert_eq!(after.state, JobState::Completed, "{:?}", after.error);
    assert!(!h.server.contains("/srv/big.bin"));
    assert!(!h.server.contains("/srv/old.log"));
    assert!(leftovers(&h.server).is_empty(), "{:?}", h.server.paths());
    assert!(h.conn.is_connected());
}

#[test]
fn cancel_mid_download_leaves_no_partial_file_and_the_next_job_runs() {
    let options = TransferOptions { resume: false, ..no_verify() };
    let h = harness_with(Arc::new(ScriptedPrompter::new()), options, |p| {
        p.reconnect_strategy = ReconnectStrategy::None;
    });
    h.server.put_file("/data/big.bin", &pattern(200_000));
    h.server.put_file("/data/small.txt", b"small");
    let tmp = tempfile::tempdir().unwrap();
    let q = h.queue.clone();
    h.server.on_bytes(16_384, move || {
        q.cancel_current();
    });

    let first = h.queue.submit(download(&["/data/big.bin"], tmp.path()));
    let second = h.queue.submit(download(&["/data/small.txt"], tmp.path()));
    assert!(h.queue.wait_idle(Some(Duration::from_secs(30))));

    assert_eq!(h.queue.job(first).unwrap().state, JobState::Cancelled);
    let after = h.queue.job(second).unwrap();
    assert_eq!(after.state, JobState::Completed, "{:?}", after.error);
    assert!(!tmp.path().join("big.bin").exists());
    assert!(part_files(tmp.path()).is_empty());
    assert_eq!(fs::read(tmp.path().join("small.txt")).unwrap(), b"small");
}

#[test]
fn cancelled_download_resumes_when_submitted_again() {
    let h = harness(Arc::new(ScriptedPrompter::new()), no_verify());
    let data = pattern(200_000);
    h.server.put_file("/data/big.bin", &data);
    let tmp = tempfile::tempdir().unwrap();
    let q = h.queue.clone();
    h.server.on_bytes(16_384, move || {
        q.cancel_current();
    });

    let first = run(&h, download(&["/data/big.bin"], tmp.path()));
    assert_eq!(first.state, JobState::Cancelled);
    assert!(!tmp.path().join("big.bin").exists());
    assert_eq!(part_files(tmp.path()).len(), 1);

    let second = run(&h, download(&["/data/big.bin"], tmp.path()));
    assert_eq!(second.state, JobState::Completed, "{:?}", second.error);
    assert!(second.status.contains("1 resumed"), "{}", second.status);
    assert_eq!(fs::read(tmp.path().join("big.bin")).unwrap(), data);
    assert!(part_files(tmp.path()).is_empty());
}

#[test]
fn large_files_fall_back_to_timestamp_verification() {
    let options = TransferOptions { hash_threshold_bytes: 1024, ..Default::default() };
    let h = harness(Arc::new(ScriptedPrompter::new()), options);
    h.server.mkdir_all("/srv");
    let tmp = tempfile::tempdir().unwrap();
    let small = tmp.path().join("small.txt");
    let big = tmp.path().join("big.bin");
    fs::write(&small, b"tiny").unwrap();
    fs::write(&big, pattern(8_000)).unwrap();

    let snap = run(&h, upload(vec![small, big.clone()], "/srv"));
    assert_eq!(snap.state, JobState::Completed, "{:?}", snap.error);
    assert!(snap.status.contains("verified 2 files (1 hashed, 1 timestamp)"), "{}", snap.status);
    let local_mtime = fs::metadata(&big).unwrap().modified().ok().and_then(system_time_secs);
    assert_eq!(h.server.mtime("/srv/big.bin"), local_mtime);
}

#[test]
fn progress_is_monotonic_and_ends_at_100() {
    let h = harness(Arc::new(ScriptedPrompter::new()), no_verify());
    for i in 0..4 {
        h.server.put_file(&format!("/data/set/part{i}.bin"), &pattern(10_000));
    }
    let rx = h.queue.subscribe();
    let tmp = tempfile::tempdir().unwrap();
    let snap = run(&h, download(&["/data/set"], tmp.path()));
    assert_eq!(snap.state, JobState::Completed, "{:?}", snap.error);

    let seen: Vec<u8> = rx.try_iter().filter(|s| s.id == snap.id).map(|s| s.progress).collect();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&100));
    assert_eq!(fs::read_dir(tmp.path().join("set")).unwrap().count(), 4);
}

#[test]
fn failed_job_can_be_retried_as_a_new_job() {
    let h = harness(Arc::new(ScriptedPrompter::new()), TransferOptions::default());
    let tmp = tempfile::tempdir().unwrap();
    let local = tmp.path().join("notes.txt");
    fs::write(&local, b"notes").unwrap();

    // parent of the destination does not exist yet
    let failed = run(&h, upload(vec![local], "/home/u/inbox"));
    assert_eq!(failed.state, JobState::Failed);
    assert!(failed.retryable);

    h.server.mkdir_all("/home/u");
    let new_id = h.queue.retry_failed(failed.id).unwrap();
    assert_ne!(new_id, failed.id);
    assert!(h.queue.wait_idle(Some(Duration::from_secs(30))));
    assert_eq!(h.queue.job(new_id).unwrap().state, JobState::Completed);
    assert!(!h.queue.job(failed.id).unwrap().retryable);
    assert_eq!(h.server.read_file("/home/u/inbox/notes.txt").unwrap(), b"notes");
    let summary = h.queue.summary();
    assert_eq!((summary.completed, summary.failed), (1, 1));
}

#[test]
fn delete_job_reports_removed_entries() {
    let h = harness(Arc::new(ScriptedPrompter::new()), TransferOptions::default());
    h.server.put_file("/tmp/build/a.o", b"a");
    h.server.put_file("/tmp/build/b.o", b"b");
    let snap = run(
        &h,
        JobDefinition::new("rm", JobWork::Delete(DeleteRequest { paths: vec!["/tmp/build".into()] })),
    );
    assert_eq!(snap.state, JobState::Completed, "{:?}", snap.error);
    assert_eq!(snap.status, "deleted 3 entries");
    assert!(!h.server.contains("/tmp/build"));
}

/// Cancels the running job from inside the conflict dialog, the way a user
/// pressing "stop" while a prompt is open would.
struct CancellingPrompter {
    queue: OnceLock<Arc<TransferQueue>>,
}

impl Prompter for CancellingPrompter {
    fn prompt_text(&self, _title: &str, _message: &str, _secret: bool) -> Option<String> {
        None
    }

    fn confirm(&self, _title: &str, _message: &str) -> bool {
        false
    }

    fn confirm_conflict(&self, _request: &ConflictRequest) -> ConflictDecision {
        if let Some(q) = self.queue.get() {
            q.cancel_current();
        }
        ConflictDecision::once(ConflictChoice::Overwrite)
    }

    fn confirm_symlink(&self, _link: &str, _target: &str) -> SymlinkChoice {
        SymlinkChoice::Cancel
    }

    fn confirm_host_key(&self, _prompt: &HostKeyPrompt) -> bool {
        false
    }
}

#[test]
fn cancel_stops_the_job_before_any_byte_moves() {
    let prompter = Arc::new(CancellingPrompter { queue: OnceLock::new() });
    let server = MemoryServer::new();
    let conn = Arc::new(ConnectionManager::new(
        Arc::new(server.connector()),
        AuthenticationResolver::new(Arc::new(NoAgent), Arc::new(ScriptedPrompter::new())),
        Arc::new(AcceptAll),
    ));
    let mut p = ConnectionProfile::new("mem", 22, "u");
    p.password = Some("pw".into());
    conn.connect(&p, &CancelToken::new()).unwrap();
    let engine = Arc::new(TransferEngine::new(conn, prompter.clone(), TransferOptions::default()));
    let queue = Arc::new(TransferQueue::new(engine));
    let _ = prompter.queue.set(queue.clone());

    server.put_file("/srv/report.pdf", b"old");
    let tmp = tempfile::tempdir().unwrap();
    let local = tmp.path().join("report.pdf");
    fs::write(&local, b"new").unwrap();

    let id = queue.submit(upload(vec![local], "/srv"));
    assert!(queue.wait_idle(Some(Duration::from_secs(30))));
    let snap = queue.job(id).unwrap();
    assert_eq!(snap.state, JobState::Cancelled);
    assert!(!snap.retryable);
    assert!(!server.events().iter().any(|e| matches!(e, MemoryEvent::OpenWrite { .. })));
    assert_eq!(server.read_file("/srv/report.pdf").unwrap(), b"old");
}
