//! Job bodies: plan, create directories, move each file, report.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::connection::ConnectionManager;
use crate::error::{Result, TransferError};
use crate::path::display_path;
use crate::prompt::Prompter;
use crate::queue::{DeleteRequest, DownloadRequest, JobContext, JobRunner, JobWork, UploadRequest};
use crate::transfer::conflict::ConflictResolver;
use crate::transfer::planner::{
    apply_delete_step, ensure_remote_dir, plan_delete, plan_download, plan_upload,
};
use crate::transfer::{Direction, Executor, TransferOptions, TransferPlan, VerificationSummary};
use crate::util::human_bytes;

pub struct TransferEngine {
    conn: Arc<ConnectionManager>,
    prompter: Arc<dyn Prompter>,
    options: TransferOptions,
    bytes: AtomicU64,
}

impl TransferEngine {
    pub fn new(conn: Arc<ConnectionManager>, prompter: Arc<dyn Prompter>, options: TransferOptions) -> Self {
        Self { conn, prompter, options, bytes: AtomicU64::new(0) }
    }

    /// Bytes of completed files across every job this engine ran.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.conn
    }

    fn run_upload(&self, req: &UploadRequest, ctx: &JobContext) -> Result<String> {
        let cancel = ctx.cancel_token();
        ctx.set_status("planning");
        // apply-to-all 只在本次执行内有效
        let mut resolver = ConflictResolver::new(self.prompter.as_ref());
        let plan = plan_upload(&self.conn, &mut resolver, &req.sources, &req.remote_dir, cancel)?;
        for dir in &plan.remote_dirs {
            cancel.check()?;
            ensure_remote_dir(&self.conn, dir, cancel)?;
        }
        self.execute(&plan, ctx)
    }

    fn run_download(&self, req: &DownloadRequest, ctx: &JobContext) -> Result<String> {
        let cancel = ctx.cancel_token();
        ctx.set_status("planning");
        let mut resolver = ConflictResolver::new(self.prompter.as_ref());
        let plan = plan_download(&self.conn, &mut resolver, &req.sources, &req.local_dir, cancel)?;
        for dir in &plan.local_dirs {
            cancel.check()?;
            std::fs::create_dir_all(dir)
                .map_err(|e| TransferError::from_local_io(&e, &display_path(dir).to_string()))?;
        }
        self.execute(&plan, ctx)
    }

    fn run_delete(&self, req: &DeleteRequest, ctx: &JobContext) -> Result<String> {
        let cancel = ctx.cancel_token();
        ctx.set_status("planning");
        let steps = plan_delete(&self.conn, self.prompter.as_ref(), &req.paths, cancel)?;
        let total = steps.len() as u64;
        for (i, step) in steps.iter().enumerate() {
            cancel.check()?;
            ctx.set_status(format!("removing {}", step.path()));
            apply_delete_step(&self.conn, step, cancel)?;
            ctx.set_fraction(i as u64 + 1, total);
        }
        Ok(format!("deleted {} entries", steps.len()))
    }

    fn execute(&self, plan: &TransferPlan, ctx: &JobContext) -> Result<String> {
        let cancel = ctx.cancel_token();
        let executor = Executor::new(self.conn.clone(), self.options.clone(), cancel.clone());
        let total = plan.total_bytes();
        let count = plan.files.len();
        let mut done = 0u64;
        let mut resumed = 0usize;
        let mut verification = VerificationSummary::default();

        for (i, item) in plan.files.iter().enumerate() {
            cancel.check()?;
            ctx.set_status(format!("{} ({}/{})", item.display_name, i + 1, count));
            let base = done;
            let mut progress = |n: u64| ctx.set_fraction(base + n.min(item.size), total);
            let outcome = match plan.direction {
                Direction::Upload => executor.upload(item, &mut progress)?,
                Direction::Download => executor.download(item, &mut progress)?,
            };
            done += item.size;
            self.bytes.fetch_add(outcome.bytes.saturating_sub(outcome.resumed_from), Ordering::Relaxed);
            if total == 0 {
                ctx.set_fraction(i as u64 + 1, count as u64);
            } else {
                ctx.set_fraction(done, total);
            }
            if let Some(mode) = outcome.verification {
                verification.record(mode);
            }
            if outcome.resumed_from > 0 {
                resumed += 1;
            }
        }

        let verb = match plan.direction {
            Direction::Upload => "uploaded",
            Direction::Download => "downloaded",
        };
        let mut status = format!("{verb} {count} files ({})", human_bytes(total));
        if verification.total() > 0 {
            status.push_str(&format!(", {}", verification.status_line()));
        }
        if resumed > 0 {
            status.push_str(&format!(", {resumed} resumed"));
        }
        info!("[exec] job finished {}", status);
        Ok(status)
    }
}

impl JobRunner for TransferEngine {
    fn run(&self, work: &JobWork, ctx: &JobContext) -> Result<String> {
        match work {
            JobWork::Upload(req) => self.run_upload(req, ctx),
            JobWork::Download(req) => self.run_download(req, ctx),
            JobWork::Delete(req) => self.run_delete(req, ctx),
        }
    }
}
