use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use owo_colors::OwoColorize;

use crate::auth::AuthenticationResolver;
use crate::cli::{ConnectArgs, HostsCommand, TransferFlags};
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::engine::TransferEngine;
use crate::known_hosts::KnownHostsStore;
use crate::prompt::{ConsolePrompter, Prompter};
use crate::queue::{JobDefinition, JobId, JobSnapshot, JobState, TransferQueue};
use crate::remote::sftp::{Ssh2AgentProbe, Ssh2Connector};
use crate::transfer::cancel::CancelToken;
use crate::util::{job_progress_bar, print_summary, write_failures_jsonl};

/// Exit code for a run that ended with a cancelled job.
pub const EXIT_CANCELLED: i32 = 130;

/// Connect, run one job through the queue with a live progress bar, offer a
/// retry for retryable failures, then print the summary. Returns the process
/// exit code.
pub fn handle_transfer(
    config: &Config,
    conn_args: &ConnectArgs,
    flags: TransferFlags,
    definition: JobDefinition,
) -> Result<i32> {
    let profile = conn_args.to_profile()?;
    let prompter: Arc<ConsolePrompter> = Arc::new(ConsolePrompter::new());
    let store = KnownHostsStore::open(&config.trust_store_path, prompter.clone())
        .with_context(|| format!("cannot open trust store {}", config.trust_store_path.display()))?;
    let resolver = AuthenticationResolver::new(Arc::new(Ssh2AgentProbe), prompter.clone());
    let conn = Arc::new(ConnectionManager::new(Arc::new(Ssh2Connector), resolver, Arc::new(store)));
    conn.connect(&profile, &CancelToken::new())
        .with_context(|| format!("cannot connect to {}", profile.addr()))?;

    let mut options = config.transfer_options();
    options.verify &= !flags.no_verify;
    options.resume &= !flags.no_resume;
    let engine = Arc::new(TransferEngine::new(conn.clone(), prompter.clone(), options));
    let queue = TransferQueue::new(engine.clone());
    let rx = queue.subscribe();
    let started = Instant::now();

    let mut id = queue.submit(definition);
    let last = loop {
        let snap = follow(&rx, id);
        if snap.state == JobState::Failed
            && snap.retryable
            && prompter.confirm("Transfer failed", &format!("{} Retry?", snap.error.as_deref().unwrap_or("")))
            && let Some(new_id) = queue.retry_failed(id)
        {
            id = new_id;
            continue;
        }
        break snap;
    };
    queue.wait_idle(None);
    conn.disconnect();

    let summary = queue.summary();
    print_summary(
        engine.bytes_transferred(),
        started.elapsed().as_secs_f64(),
        summary.completed,
        summary.failed,
        conn.reconnect_count(),
    );
    let failures: Vec<JobSnapshot> =
        queue.jobs().into_iter().filter(|j| j.state == JobState::Failed).collect();
    write_failures_jsonl(&config.failures_log_path(), &failures);

    Ok(match last.state {
        JobState::Completed => 0,
        JobState::Cancelled => EXIT_CANCELLED,
        _ => 1,
    })
}

/// Render snapshots of `id` until it finishes; returns the final one.
fn follow(rx: &Receiver<JobSnapshot>, id: JobId) -> JobSnapshot {
    let pb = job_progress_bar();
    let last = loop {
        let Ok(snap) = rx.recv() else {
            break None;
        };
        if snap.id != id {
            continue;
        }
        pb.set_prefix(snap.title.clone());
        pb.set_position(snap.progress as u64);
        pb.set_message(snap.status.clone());
        if snap.state.is_finished() {
            break Some(snap);
        }
    };
    pb.finish_and_clear();
    let Some(snap) = last else {
        eprintln!("❌ 任务状态通道已关闭");
        return JobSnapshot {
            id,
            kind: crate::queue::JobKind::Upload,
            title: String::new(),
            state: JobState::Failed,
            progress: 0,
            status: String::new(),
            error: Some("queue closed".into()),
            retryable: false,
        };
    };
    match snap.state {
        JobState::Completed => println!("✅ {} {}: {}", snap.id, snap.title, snap.status.green()),
        JobState::Cancelled => println!("⏹ {} {}: cancelled", snap.id, snap.title),
        _ => eprintln!(
            "❌ {} {}: {}",
            snap.id,
            snap.title,
            snap.error.as_deref().unwrap_or("failed").red()
        ),
    }
    snap
}

pub fn handle_hosts(config: &Config, action: HostsCommand) -> Result<()> {
    let prompter = Arc::new(ConsolePrompter::new());
    let store = KnownHostsStore::open(&config.trust_store_path, prompter.clone())
        .with_context(|| format!("cannot open trust store {}", config.trust_store_path.display()))?;
    match action {
        HostsCommand::List { json } => {
            let entries = store.entries()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("没有已信任的主机密钥");
            } else {
                for e in entries {
                    println!(
                        "{:<32} {:<22} {}  {}",
                        format!("{}:{}", e.host, e.port),
                        e.algorithm,
                        e.fingerprint,
                        e.trusted_at.dimmed()
                    );
                }
            }
        }
        HostsCommand::Forget { host, port, algorithm } => {
            let n = store.remove(&host, port, algorithm.as_deref())?;
            if n == 0 {
                eprintln!("⚠️ {}:{} 没有已信任的密钥", host, port);
            } else {
                println!("✅ 已删除 {} 条 {}:{} 的密钥记录", n, host, port);
            }
        }
        HostsCommand::Clear { yes } => {
            if !yes && !prompter.confirm("Clear trust store", "Forget every pinned host key?") {
                return Ok(());
            }
            let n = store.clear()?;
            println!("✅ 已清除 {} 条密钥记录", n);
        }
    }
    Ok(())
}
