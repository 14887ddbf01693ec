//! Cancellation shared between a pool and its workers.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Work run once when a token is cancelled.
pub type CancelHook = Box<dyn FnOnce() + Send>;

/// Signals a pool's workers to stop picking up queued work.
///
/// Workers poll [`is_cancelled`](Self::is_cancelled) between items. Resources
/// that cannot poll, such as child processes blocked on IO, register an
/// [`on_cancel`](Self::on_cancel) hook instead. Only the first cancellation
/// counts.
#[derive(Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    reason: OnceLock<String>,
    hooks: Mutex<Vec<CancelHook>>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token and runs the registered hooks on this thread.
    ///
    /// Returns true if this call performed the cancellation, false if the
    /// token was already cancelled. A panicking hook is logged and the
    /// remaining hooks still run.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        // The hook lock orders this against a concurrent `on_cancel`.
        let hooks = {
            let mut hooks = self.hooks.lock();
            if self.cancelled.swap(true, Ordering::SeqCst) {
                return false;
            }
            std::mem::take(&mut *hooks)
        };
        let reason = reason.into();
        debug!(reason = %reason, hooks = hooks.len(), "Cancelling");
        let _ = self.reason.set(reason);
        for hook in hooks {
            run_hook(hook);
        }
        true
    }

    /// Registers `hook` to run on cancellation, or runs it now if the token
    /// is already cancelled.
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = self.hooks.lock();
        if self.is_cancelled() {
            drop(hooks);
            run_hook(Box::new(hook));
        } else {
            hooks.push(Box::new(hook));
        }
    }

    /// Returns whether the token was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The reason given by the first cancellation.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }
}

fn run_hook(hook: CancelHook) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(hook)) {
        warn!(payload = ?payload, "Cancel hook panicked");
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .field("hooks", &self.hooks.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_first_cancel_wins() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.reason(), None);

        assert!(token.cancel("pool shutdown"));
        assert!(!token.cancel("pool dropped"));
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("pool shutdown"));
    }

    #[test]
    fn test_hooks_run_once() {
        let token = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        token.on_cancel(counting(&counter));
        token.on_cancel(counting(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        token.cancel("stop");
        token.cancel("stop again");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_late_hook_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel("done");

        let counter = Arc::new(AtomicUsize::new(0));
        token.on_cancel(counting(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_hook_does_not_block_others() {
        let token = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        token.on_cancel(|| panic!("hook failed"));
        token.on_cancel(counting(&counter));

        assert!(token.cancel("stop"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_cancel_has_one_winner() {
        let token = Arc::new(CancellationToken::new());
        let counter = Arc::new(AtomicUsize::new(0));
        token.on_cancel(counting(&counter));

        let winners: usize = (0..8)
            .map(|i| {
                let token = Arc::clone(&token);
                std::thread::spawn(move || token.cancel(format!("thread {i}")))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| usize::from(handle.join().unwrap()))
            .sum();

        assert_eq!(winners, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
