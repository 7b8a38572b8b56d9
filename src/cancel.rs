//! Cooperative cancellation token.
//!
//! Executors install a canceller on each future they run; the canceller sets
//! this token, and the worker polls it between hardware-blocking calls. The
//! framework never forcibly terminates an in-flight hardware operation, so
//! worst-case stop latency is the duration of the current uninterruptible
//! step.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared cancellation flag with an interruptible wait.
///
/// Cloning the token shares the underlying flag. Task bodies receive a token
/// and must check [`is_cancelled`](CancellationToken::is_cancelled) at their
/// checkpoints; [`wait_timeout`](CancellationToken::wait_timeout) doubles as
/// a cancellable sleep for simulated or paced work.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl CancellationToken {
    /// Create a fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake any waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock();
        self.inner.cond.notify_all();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for up to `timeout`, returning early on cancellation.
    ///
    /// Returns `true` if the token was cancelled before the timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            let now = std::time::Instant::now();
            if now >= deadline {
                break;
            }
            self.inner.cond.wait_for(&mut guard, deadline - now);
        }
        self.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_starts_clear() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_is_shared_across_clones() {
        let token = CancellationToken::new();
        let other = token.clone();
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_wait_timeout_elapses_when_not_cancelled() {
        let token = CancellationToken::new();
        let started = std::time::Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_timeout_wakes_on_cancel() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(10));
        token.cancel();
        assert!(handle.join().unwrap());
    }
}
