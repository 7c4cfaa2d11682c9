//! Cooperative cancellation shared between a job, its planner steps and the
//! executor's blocking I/O.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Result, TransferError};

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Hooks {
    next_id: u64,
    pending: Vec<(u64, Hook)>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    hooks: Mutex<Hooks>,
    wake: Condvar,
}

/// Clonable cancellation signal. Every clone observes the same state.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken").field("cancelled", &self.is_cancelled()).finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Registered hooks run once, on the calling thread.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = {
            let mut g = self.inner.hooks.lock().unwrap_or_else(|p| p.into_inner());
            self.inner.wake.notify_all();
            std::mem::take(&mut g.pending)
        };
        for (_, hook) in hooks {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the token fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() { Err(TransferError::Cancelled) } else { Ok(()) }
    }

    /// Sleep for `dur`, waking early with `Err(Cancelled)` on cancellation.
    pub fn sleep(&self, dur: Duration) -> Result<()> {
        let deadline = Instant::now() + dur;
        let mut g = self.inner.hooks.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if self.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            g = match self.inner.wake.wait_timeout(g, deadline - now) {
                Ok((g, _)) => g,
                Err(p) => p.into_inner().0,
            };
        }
    }

    /// Run `hook` when the token fires (immediately if it already has).
    /// Dropping the returned registration unregisters the hook.
    pub fn on_cancel<F>(&self, hook: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut g = self.inner.hooks.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_cancelled() {
            drop(g);
            hook();
            return CancelRegistration { token: None, id: 0 };
        }
        g.next_id += 1;
        let id = g.next_id;
        g.pending.push((id, Box::new(hook)));
        CancelRegistration { token: Some(self.clone()), id }
    }
}

/// Keeps an [`CancelToken::on_cancel`] hook registered while alive.
#[must_use = "the hook is unregistered when the registration is dropped"]
pub struct CancelRegistration {
    token: Option<CancelToken>,
    id: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            let mut g = token.inner.hooks.lock().unwrap_or_else(|p| p.into_inner());
            g.pending.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn hooks_run_once_and_unregister_on_drop() {
        let t = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = hits.clone();
        let _kept = t.on_cancel(move || {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let h2 = hits.clone();
        let dropped = t.on_cancel(move || {
            h2.fetch_add(10, Ordering::SeqCst);
        });
        drop(dropped);
        t.cancel();
        t.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(t.check(), Err(TransferError::Cancelled)));
    }

    #[test]
    fn hook_registered_after_cancel_runs_immediately() {
        let t = CancelToken::new();
        t.cancel();
        let hit = Arc::new(AtomicBool::new(false));
        let h = hit.clone();
        let _r = t.on_cancel(move || h.store(true, Ordering::SeqCst));
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let t = CancelToken::new();
        let t2 = t.clone();
        let started = Instant::now();
        let h = std::thread::spawn(move || t2.sleep(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(50));
        t.cancel();
        let res = h.join().unwrap();
        assert!(matches!(res, Err(TransferError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(CancelToken::new().sleep(Duration::from_millis(1)).is_ok());
    }
}
