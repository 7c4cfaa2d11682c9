//! Single-flight job queue. One background worker drains jobs in FIFO order;
//! observers follow progress through snapshot subscriptions.
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{Result, TransferError};
use crate::transfer::cancel::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobKind {
    Upload,
    Download,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

/// Point-in-time view of a job, safe to hand to any thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub title: String,
    pub state: JobState,
    /// 0..=100, never decreases within one execution.
    pub progress: u8,
    pub status: String,
    pub error: Option<String>,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub sources: Vec<PathBuf>,
    pub remote_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub sources: Vec<String>,
    pub local_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobWork {
    Upload(UploadRequest),
    Download(DownloadRequest),
    Delete(DeleteRequest),
}

impl JobWork {
    pub fn kind(&self) -> JobKind {
        match self {
            JobWork::Upload(_) => JobKind::Upload,
            JobWork::Download(_) => JobKind::Download,
            JobWork::Delete(_) => JobKind::Delete,
        }
    }

    /// Equivalent work for a retry. Requests only carry paths; sizes, mtimes
    /// and conflicts are read again when the retry is planned.
    pub fn rebuild(&self) -> JobWork {
        self.clone()
    }
}

#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub title: String,
    pub work: JobWork,
    /// Keep a rebuild of the work on failure so `retry_failed` can resubmit.
    pub retry: bool,
}

impl JobDefinition {
    pub fn new(title: impl Into<String>, work: JobWork) -> Self {
        Self { title: title.into(), work, retry: true }
    }

    pub fn without_retry(mut self) -> Self {
        self.retry = false;
        self
    }
}

/// Executes one job body on the queue's worker thread. `Ok` carries the
/// final status text.
pub trait JobRunner: Send + Sync {
    fn run(&self, work: &JobWork, ctx: &JobContext) -> Result<String>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct Job {
    snapshot: JobSnapshot,
    work: JobWork,
    retry: bool,
}

struct QueueState {
    next_id: u64,
    jobs: Vec<Job>,
    pending: VecDeque<JobId>,
    current: Option<(JobId, CancelToken)>,
    worker_active: bool,
    factories: HashMap<JobId, JobWork>,
}

impl QueueState {
    fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.snapshot.id == id)
    }
}

struct Shared {
    state: Mutex<QueueState>,
    idle: Condvar,
    subscribers: Mutex<Vec<Sender<JobSnapshot>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, snapshot: JobSnapshot) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }

    /// Apply `f` to a job and publish the result when `f` reports a change.
    fn update(&self, id: JobId, f: impl FnOnce(&mut JobSnapshot) -> bool) {
        let snapshot = {
            let mut st = self.lock();
            match st.job_mut(id) {
                Some(job) => {
                    if f(&mut job.snapshot) {
                        Some(job.snapshot.clone())
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(s) = snapshot {
            self.publish(s);
        }
    }
}

/// Handle given to a running job body.
pub struct JobContext {
    id: JobId,
    cancel: CancelToken,
    shared: Arc<Shared>,
}

impl JobContext {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Raise progress to `percent`. Lower values are ignored.
    pub fn set_progress(&self, percent: u8) {
        let percent = percent.min(100);
        self.shared.update(self.id, |s| {
            if percent > s.progress {
                s.progress = percent;
                true
            } else {
                false
            }
        });
    }

    pub fn set_fraction(&self, done: u64, total: u64) {
        if total == 0 {
            return;
        }
        let pct = (done.min(total) as u128 * 100 / total as u128) as u8;
        self.set_progress(pct);
    }

    pub fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        self.shared.update(self.id, |s| {
            if s.status != status {
                s.status = status;
                true
            } else {
                false
            }
        });
    }
}

pub struct TransferQueue {
    shared: Arc<Shared>,
    runner: Arc<dyn JobRunner>,
}

impl TransferQueue {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    next_id: 1,
                    jobs: Vec::new(),
                    pending: VecDeque::new(),
                    current: None,
                    worker_active: false,
                    factories: HashMap::new(),
                }),
                idle: Condvar::new(),
                subscribers: Mutex::new(Vec::new()),
            }),
            runner,
        }
    }

    /// Enqueue a job and start the worker if none is draining.
    pub fn submit(&self, definition: JobDefinition) -> JobId {
        let (id, snapshot, spawn) = {
            let mut st = self.shared.lock();
            let id = JobId(st.next_id);
            st.next_id += 1;
            let snapshot = JobSnapshot {
                id,
                kind: definition.work.kind(),
                title: definition.title,
                state: JobState::Pending,
                progress: 0,
                status: "queued".to_string(),
                error: None,
                retryable: false,
            };
            st.jobs.push(Job { snapshot: snapshot.clone(), work: definition.work, retry: definition.retry });
            st.pending.push_back(id);
            let spawn = !st.worker_active;
            st.worker_active = true;
            (id, snapshot, spawn)
        };
        info!("[queue] submitted id={} kind={:?} title={}", id, snapshot.kind, snapshot.title);
        self.shared.publish(snapshot);
        if spawn {
            let shared = self.shared.clone();
            let runner = self.runner.clone();
            let res = std::thread::Builder::new()
                .name("skiff-queue".into())
                .spawn(move || worker_loop(shared, runner));
            if let Err(e) = res {
                error!("[queue] cannot start worker err={}", e);
                self.shared.lock().worker_active = false;
                self.shared.idle.notify_all();
            }
        }
        id
    }

    /// Signal the running job, if any. Pending jobs are unaffected.
    pub fn cancel_current(&self) -> Option<JobId> {
        let current = self.shared.lock().current.clone();
        let (id, token) = current?;
        info!("[queue] cancel requested id={}", id);
        token.cancel();
        Some(id)
    }

    /// Resubmit a retryable failed job as a new job. The failed job stays in
    /// history and loses its retry flag.
    pub fn retry_failed(&self, id: JobId) -> Option<JobId> {
        let (definition, snapshot) = {
            let mut st = self.shared.lock();
            let retryable = st.jobs.iter().any(|j| j.snapshot.id == id && j.snapshot.retryable);
            if !retryable {
                return None;
            }
            let work = st.factories.remove(&id)?;
            let job = st.job_mut(id)?;
            job.snapshot.retryable = false;
            let definition = JobDefinition { title: job.snapshot.title.clone(), work, retry: job.retry };
            (definition, job.snapshot.clone())
        };
        self.shared.publish(snapshot);
        let new_id = self.submit(definition);
        info!("[queue] retry id={} as id={}", id, new_id);
        Some(new_id)
    }

    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.shared.lock().jobs.iter().map(|j| j.snapshot.clone()).collect()
    }

    pub fn job(&self, id: JobId) -> Option<JobSnapshot> {
        self.shared.lock().jobs.iter().find(|j| j.snapshot.id == id).map(|j| j.snapshot.clone())
    }

    pub fn summary(&self) -> QueueSummary {
        let st = self.shared.lock();
        let mut s = QueueSummary::default();
        for j in &st.jobs {
            match j.snapshot.state {
                JobState::Pending => s.pending += 1,
                JobState::Running => s.running += 1,
                JobState::Completed => s.completed += 1,
                JobState::Failed => s.failed += 1,
                JobState::Cancelled => s.cancelled += 1,
            }
        }
        s
    }

    /// Drop finished jobs (and their retry rebuilds) from history.
    pub fn clear_finished(&self) -> usize {
        let mut st = self.shared.lock();
        let before = st.jobs.len();
        let finished: Vec<JobId> =
            st.jobs.iter().filter(|j| j.snapshot.state.is_finished()).map(|j| j.snapshot.id).collect();
        for id in &finished {
            st.factories.remove(id);
        }
        st.jobs.retain(|j| !j.snapshot.state.is_finished());
        before - st.jobs.len()
    }

    /// Every snapshot change from now on. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<JobSnapshot> {
        let (tx, rx) = unbounded();
        self.shared.subscribers.lock().unwrap_or_else(|p| p.into_inner()).push(tx);
        rx
    }

    /// Block until the queue is drained. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.shared.lock();
        while st.worker_active || !st.pending.is_empty() {
            match deadline {
                None => st = self.shared.idle.wait(st).unwrap_or_else(|p| p.into_inner()),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    let (g, _) =
                        self.shared.idle.wait_timeout(st, d - now).unwrap_or_else(|p| p.into_inner());
                    st = g;
                }
            }
        }
        true
    }
}

fn worker_loop(shared: Arc<Shared>, runner: Arc<dyn JobRunner>) {
    loop {
        let next = {
            let mut st = shared.lock();
            match st.pending.pop_front() {
                None => {
                    st.worker_active = false;
                    st.current = None;
                    shared.idle.notify_all();
                    return;
                }
                Some(id) => {
                    let cancel = CancelToken::new();
                    st.current = Some((id, cancel.clone()));
                    st.factories.remove(&id);
                    st.job_mut(id).map(|job| {
                        job.snapshot.state = JobState::Running;
                        job.snapshot.progress = 0;
                        job.snapshot.status = "running".to_string();
                        job.snapshot.error = None;
                        job.snapshot.retryable = false;
                        (id, job.work.clone(), job.retry, cancel, job.snapshot.clone())
                    })
                }
            }
        };
        let Some((id, work, retry, cancel, snapshot)) = next else {
            continue;
        };
        shared.publish(snapshot);
        info!("[queue] job started id={} kind={:?}", id, work.kind());

        let ctx = JobContext { id, cancel: cancel.clone(), shared: shared.clone() };
        let outcome = catch_unwind(AssertUnwindSafe(|| runner.run(&work, &ctx)))
            .unwrap_or_else(|_| Err(TransferError::OperationFailed("job panicked".into())));

        let snapshot = {
            let mut st = shared.lock();
            st.current = None;
            let mut factory = None;
            let snapshot = st.job_mut(id).map(|job| {
                let s = &mut job.snapshot;
                match &outcome {
                    Ok(status) => {
                        s.state = JobState::Completed;
                        s.progress = 100;
                        s.status = status.clone();
                        info!("[queue] job completed id={} status={}", id, status);
                    }
                    Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                        s.state = JobState::Cancelled;
                        s.status = "cancelled".to_string();
                        info!("[queue] job cancelled id={}", id);
                    }
                    Err(e) => {
                        s.state = JobState::Failed;
                        s.status = "failed".to_string();
                        s.error = Some(e.to_string());
                        if retry {
                            s.retryable = true;
                            factory = Some(work.rebuild());
                        }
                        warn!("[queue] job failed id={} retryable={} err={}", id, s.retryable, e);
                    }
                }
                s.clone()
            });
            if let Some(w) = factory {
                st.factories.insert(id, w);
            }
            snapshot
        };
        if let Some(s) = snapshot {
            shared.publish(s);
        }
    }
}
