use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::error::{Result, TransferError};
use crate::queue::JobSnapshot;
use crate::transfer::cancel::CancelToken;

/// Try to enable ANSI escape sequence support on Windows consoles.
/// Returns true if enabling succeeded (or platform likely already supports ANSI), false otherwise.
#[cfg(windows)]
pub fn try_enable_ansi_on_windows() -> bool {
    enable_ansi_support::enable_ansi_support().is_ok()
}

// On non-Windows platforms the crate is not required; terminals speak ANSI already.
#[cfg(not(windows))]
pub fn try_enable_ansi_on_windows() -> bool {
    true
}

/// Convert a byte count into a human readable string using IEC units (KiB/MiB/GiB).
pub fn human_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Seconds since the Unix epoch; `None` for pre-epoch times.
pub fn system_time_secs(t: SystemTime) -> Option<u64> {
    t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

/// Job-level progress bar: percent of the running job plus its status text.
pub fn job_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:30.cyan/blue}] {pos:>3}% {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(200));
    let _ = try_enable_ansi_on_windows();
    pb
}

/// Print a concise summary line once the queue drains.
pub fn print_summary(total_bytes: u64, elapsed_secs: f64, completed: usize, failed: usize, reconnects: u32) {
    let rate = if elapsed_secs > 0.0 {
        total_bytes as f64 / 1024.0 / 1024.0 / elapsed_secs
    } else {
        0.0
    };
    let line = format!(
        "平均速率: {:.2} MB/s (传输 {}, 耗时 {:.2} 秒) | 完成: {} | 失败: {} | 重连: {}",
        rate,
        human_bytes(total_bytes),
        elapsed_secs,
        completed,
        failed,
        reconnects
    );
    if failed > 0 && try_enable_ansi_on_windows() {
        println!("{}", line.yellow());
    } else {
        println!("{}", line);
    }
}

/// Append failed jobs as JSON Lines, one object per job, each stamped with the
/// UTC time of this run.
pub fn write_failures_jsonl(path: &Path, failures: &[JobSnapshot]) {
    if failures.is_empty() {
        return;
    }
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(mut f) => {
            for job in failures {
                let obj = serde_json::json!({
                    "at": stamp,
                    "id": job.id.0,
                    "kind": job.kind,
                    "title": job.title,
                    "error": job.error,
                    "retryable": job.retryable,
                });
                let _ = writeln!(f, "{}", obj);
            }
            info!("[queue] wrote {} failure(s) to {}", failures.len(), path.display());
        }
        Err(e) => warn!("[queue] cannot write failure log path={} err={}", path.display(), e),
    }
}

// Default backoff base in milliseconds. Can be adjusted at runtime via `set_backoff_ms`.
static BACKOFF_BASE_MS: AtomicU64 = AtomicU64::new(250);

/// Set the base backoff in milliseconds used by `retry_operation` between attempts.
pub fn set_backoff_ms(ms: u64) {
    BACKOFF_BASE_MS.store(ms, Ordering::SeqCst);
}

/// Get the current base backoff in milliseconds used by `retry_operation`.
pub fn get_backoff_ms() -> u64 {
    BACKOFF_BASE_MS.load(Ordering::SeqCst)
}

/// Per-file retry helper. Transient errors are retried up to `max_attempts`
/// total tries with an incremental backoff; cancellation is returned at once
/// and anything else is terminal.
pub fn retry_operation<F, T>(max_attempts: usize, cancel: &CancelToken, mut op: F) -> Result<T>
where
    F: FnMut(usize) -> Result<T>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        cancel.check()?;
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => return Err(TransferError::Cancelled),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let wait = get_backoff_ms().saturating_mul(attempt as u64 + 1);
                warn!("[exec] attempt {}/{} failed, retrying in {}ms err={}", attempt + 1, max_attempts, wait, e);
                cancel.sleep(Duration::from_millis(wait))?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.00 MiB");
    }

    #[test]
    fn retry_stops_on_terminal_error() {
        set_backoff_ms(1);
        let calls = Cell::new(0);
        let r: Result<()> = retry_operation(3, &CancelToken::new(), |_| {
            calls.set(calls.get() + 1);
            Err(TransferError::NotFound("/x".into()))
        });
        assert!(matches!(r, Err(TransferError::NotFound(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retry_exhausts_transient_budget() {
        set_backoff_ms(1);
        let calls = Cell::new(0);
        let r: Result<()> = retry_operation(3, &CancelToken::new(), |_| {
            calls.set(calls.get() + 1);
            Err(TransferError::Io("reset".into()))
        });
        assert!(matches!(r, Err(TransferError::Io(_))));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_succeeds_after_transient() {
        set_backoff_ms(1);
        let r = retry_operation(3, &CancelToken::new(), |attempt| {
            if attempt == 0 { Err(TransferError::Timeout("t".into())) } else { Ok(attempt) }
        });
        assert_eq!(r.unwrap(), 1);
    }

    #[test]
    fn failures_are_appended_as_json_lines() {
        use crate::queue::{JobId, JobKind, JobState};
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/failures.jsonl");
        let snap = JobSnapshot {
            id: JobId(7),
            kind: JobKind::Upload,
            title: "put a.txt".into(),
            state: JobState::Failed,
            progress: 40,
            status: String::new(),
            error: Some("permission denied: /r/a.txt".into()),
            retryable: true,
        };
        write_failures_jsonl(&path, &[snap.clone()]);
        write_failures_jsonl(&path, &[snap]);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["kind"], "Upload");
        assert_eq!(v["retryable"], true);
    }
}
