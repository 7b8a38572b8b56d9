//! Cancellable futures with live progress estimates.
//!
//! [`ProgressiveFuture`] is the handle every long-running hardware operation
//! is submitted and observed through. It combines three concerns:
//!
//! - a monotone state machine `Pending -> Running -> {Finished, Failed,
//!   Cancelled}` where the terminal states are final;
//! - a mutable progress estimate `(start, end)` that the executing worker
//!   refines as the operation advances, broadcast to update subscribers;
//! - cooperative cancellation through an optional *canceller* installed by
//!   whoever executes the task.
//!
//! # Sharing
//!
//! The handle is a cheap clone over `Arc`-shared state, the same shape as the
//! reactive parameter handles elsewhere in this stack: the submitter keeps
//! one clone, the executing worker another, and any number of observers may
//! subscribe through callbacks for the lifetime of the future.
//!
//! # Locking
//!
//! One mutex per future guards state transitions and callback-list mutation.
//! Callbacks are always invoked after the lock is released, so a callback may
//! freely call back into the future (query state, subscribe another callback)
//! without deadlocking.

use crate::cancel::CancellationToken;
use crate::error::{AcqError, AcqResult};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Lifecycle phase of a future. Terminal phases are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuturePhase {
    /// Created but not yet picked up by a worker.
    Pending,
    /// A worker is executing the task.
    Running,
    /// The task completed and stored a result.
    Finished,
    /// The task failed and stored an error.
    Failed,
    /// The future was cancelled.
    Cancelled,
}

impl FuturePhase {
    /// Whether this phase is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FuturePhase::Finished | FuturePhase::Failed | FuturePhase::Cancelled
        )
    }
}

impl std::fmt::Display for FuturePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FuturePhase::Pending => write!(f, "pending"),
            FuturePhase::Running => write!(f, "running"),
            FuturePhase::Finished => write!(f, "finished"),
            FuturePhase::Failed => write!(f, "failed"),
            FuturePhase::Cancelled => write!(f, "cancelled"),
        }
    }
}

type DoneCallback<T> = Box<dyn Fn(&ProgressiveFuture<T>) + Send>;
type UpdateCallback<T> = Arc<dyn Fn(&ProgressiveFuture<T>, Instant, Instant) + Send + Sync>;
type Canceller<T> = Box<dyn FnOnce(&ProgressiveFuture<T>) -> bool + Send>;

struct FutureState<T> {
    phase: FuturePhase,
    result: Option<T>,
    error: Option<Arc<anyhow::Error>>,
    start: Instant,
    end: Instant,
    canceller: Option<Canceller<T>>,
    /// Fired once on the terminal transition, drained at that point.
    done_callbacks: Vec<DoneCallback<T>>,
    /// Fired on every progress update, retained for the future's lifetime.
    update_callbacks: Vec<UpdateCallback<T>>,
}

struct FutureInner<T> {
    state: Mutex<FutureState<T>>,
    done_cond: Condvar,
}

/// A handle to the eventual result of a long-running operation, with a
/// mutable time-to-completion estimate and cooperative cancellation.
pub struct ProgressiveFuture<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for ProgressiveFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for ProgressiveFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("ProgressiveFuture")
            .field("phase", &st.phase)
            .field("has_canceller", &st.canceller.is_some())
            .finish_non_exhaustive()
    }
}

impl<T> Default for ProgressiveFuture<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ProgressiveFuture<T>
where
    T: Send + 'static,
{
    /// Create a Pending future holding no canceller.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(FutureInner {
                state: Mutex::new(FutureState {
                    phase: FuturePhase::Pending,
                    result: None,
                    error: None,
                    start: now,
                    end: now,
                    canceller: None,
                    done_callbacks: Vec::new(),
                    update_callbacks: Vec::new(),
                }),
                done_cond: Condvar::new(),
            }),
        }
    }

    /// Create a future whose estimated duration is already known.
    pub fn with_estimated_duration(duration: Duration) -> Self {
        let fut = Self::new();
        {
            let mut st = fut.inner.state.lock();
            st.end = st.start + duration;
        }
        fut
    }

    // ---- state queries --------------------------------------------------

    /// Current lifecycle phase.
    pub fn phase(&self) -> FuturePhase {
        self.inner.state.lock().phase
    }

    /// Whether the future has reached a terminal state.
    pub fn done(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Whether the future has been cancelled.
    pub fn cancelled(&self) -> bool {
        self.phase() == FuturePhase::Cancelled
    }

    /// Whether a worker is currently executing the task.
    pub fn running(&self) -> bool {
        self.phase() == FuturePhase::Running
    }

    /// The current `(start, end)` progress estimate.
    pub fn progress(&self) -> (Instant, Instant) {
        let st = self.inner.state.lock();
        (st.start, st.end)
    }

    /// Time until the estimated end, zero once terminal or overdue.
    pub fn estimated_remaining(&self) -> Duration {
        let st = self.inner.state.lock();
        if st.phase.is_terminal() {
            Duration::ZERO
        } else {
            st.end.saturating_duration_since(Instant::now())
        }
    }

    // ---- worker-side transitions ----------------------------------------

    /// Transition Pending to Running.
    ///
    /// Returns `false` without side effects if the future was cancelled
    /// before the worker picked it up. Exactly one caller (the worker)
    /// invokes this.
    pub fn set_running_or_notify_cancel(&self) -> bool {
        {
            let mut st = self.inner.state.lock();
            match st.phase {
                FuturePhase::Cancelled => return false,
                FuturePhase::Pending => {
                    st.phase = FuturePhase::Running;
                }
                other => {
                    debug!(phase = %other, "set_running on non-pending future ignored");
                    return false;
                }
            }
        }
        // Re-anchor the estimate at the actual start of execution.
        self.set_progress(Some(Instant::now()), None);
        true
    }

    /// Update the progress estimate and notify every update subscriber.
    ///
    /// `None` keeps the corresponding bound unchanged. Callable in any state,
    /// including before `Running`. The end bound is clamped to never precede
    /// the start bound.
    pub fn set_progress(&self, start: Option<Instant>, end: Option<Instant>) {
        let (callbacks, start, end) = {
            let mut st = self.inner.state.lock();
            if let Some(s) = start {
                st.start = s;
            }
            if let Some(e) = end {
                st.end = e;
            }
            if st.end < st.start {
                st.end = st.start;
            }
            (st.update_callbacks.clone(), st.start, st.end)
        };
        for cb in callbacks {
            (*cb)(self, start, end);
        }
    }

    /// Store the result and transition Running to Finished.
    ///
    /// Ignored if the future is already Cancelled (the worker lost a
    /// cancellation race and its outcome is discarded).
    pub fn set_result(&self, value: T) {
        let drained = {
            let mut st = self.inner.state.lock();
            match st.phase {
                FuturePhase::Pending | FuturePhase::Running => {
                    st.result = Some(value);
                    st.phase = FuturePhase::Finished;
                    self.drain_terminal(&mut st)
                }
                FuturePhase::Cancelled => {
                    debug!("result for cancelled future discarded");
                    return;
                }
                other => {
                    debug!(phase = %other, "set_result on terminal future ignored");
                    return;
                }
            }
        };
        self.fire_done(drained);
    }

    /// Store a failure and transition Running to Failed.
    ///
    /// Ignored if the future is already Cancelled.
    pub fn set_exception(&self, error: anyhow::Error) {
        let drained = {
            let mut st = self.inner.state.lock();
            match st.phase {
                FuturePhase::Pending | FuturePhase::Running => {
                    st.error = Some(Arc::new(error));
                    st.phase = FuturePhase::Failed;
                    self.drain_terminal(&mut st)
                }
                FuturePhase::Cancelled => {
                    debug!("error for cancelled future discarded: {error:#}");
                    return;
                }
                other => {
                    debug!(phase = %other, "set_exception on terminal future ignored");
                    return;
                }
            }
        };
        self.fire_done(drained);
    }

    /// Install the canceller the executing worker honours.
    ///
    /// The canceller is a cooperative signal: it must request the task to
    /// stop (typically by cancelling the task's [`CancellationToken`]) and
    /// report whether the request was accepted. It is invoked at most once,
    /// and never for a future cancelled before it started running.
    pub fn set_task_canceller<F>(&self, canceller: F)
    where
        F: FnOnce(&ProgressiveFuture<T>) -> bool + Send + 'static,
    {
        self.inner.state.lock().canceller = Some(Box::new(canceller));
    }

    // ---- cancellation ----------------------------------------------------

    /// Request cancellation.
    ///
    /// - Pending: transitions directly to Cancelled, never invoking the
    ///   canceller, and returns `true`.
    /// - Running: invokes the canceller (outside the lock, exactly once) and
    ///   transitions to Cancelled only if it reports success.
    /// - Already Cancelled: returns `true` (idempotent re-cancel).
    /// - Finished or Failed: returns `false`.
    pub fn cancel(&self) -> bool {
        let canceller = {
            let mut st = self.inner.state.lock();
            match st.phase {
                FuturePhase::Pending => {
                    st.phase = FuturePhase::Cancelled;
                    let drained = self.drain_terminal(&mut st);
                    drop(st);
                    self.fire_done(drained);
                    debug!("pending future cancelled");
                    return true;
                }
                FuturePhase::Running => match st.canceller.take() {
                    Some(c) => c,
                    None => return false,
                },
                FuturePhase::Cancelled => return true,
                FuturePhase::Finished | FuturePhase::Failed => return false,
            }
        };

        if !canceller(self) {
            debug!("canceller declined cancellation");
            return false;
        }

        let drained = {
            let mut st = self.inner.state.lock();
            match st.phase {
                FuturePhase::Running => {
                    st.phase = FuturePhase::Cancelled;
                    self.drain_terminal(&mut st)
                }
                // The worker finished while the canceller ran.
                FuturePhase::Cancelled => return true,
                _ => return false,
            }
        };
        self.fire_done(drained);
        true
    }

    /// Force-transition a not-yet-terminal future to Cancelled without
    /// consulting the canceller. Used by the batch future once every
    /// sub-future is terminal and at least one ended cancelled.
    pub(crate) fn mark_cancelled(&self) -> bool {
        let drained = {
            let mut st = self.inner.state.lock();
            match st.phase {
                FuturePhase::Pending | FuturePhase::Running => {
                    st.phase = FuturePhase::Cancelled;
                    self.drain_terminal(&mut st)
                }
                FuturePhase::Cancelled => return true,
                _ => return false,
            }
        };
        self.fire_done(drained);
        true
    }

    // ---- observation -----------------------------------------------------

    /// Subscribe to the terminal transition.
    ///
    /// Fires exactly once. If the future is already terminal the callback is
    /// invoked immediately, so an observer can never miss the transition.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: Fn(&ProgressiveFuture<T>) + Send + 'static,
    {
        let fire_now = {
            let mut st = self.inner.state.lock();
            if st.phase.is_terminal() {
                true
            } else {
                st.done_callbacks.push(Box::new(callback));
                return;
            }
        };
        if fire_now {
            callback(self);
        }
    }

    /// Subscribe to progress updates `(future, start, end)`.
    pub fn add_update_callback<F>(&self, callback: F)
    where
        F: Fn(&ProgressiveFuture<T>, Instant, Instant) + Send + Sync + 'static,
    {
        self.inner.state.lock().update_callbacks.push(Arc::new(callback));
    }

    /// Block until terminal and return the outcome.
    ///
    /// Returns the stored result for a Finished future (idempotently on
    /// repeated calls), the stored error for a Failed one, and
    /// [`AcqError::Cancelled`] for a Cancelled one. A bounded wait that
    /// elapses first returns [`AcqError::Timeout`].
    pub fn result(&self, timeout: Option<Duration>) -> AcqResult<T>
    where
        T: Clone,
    {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut st = self.inner.state.lock();
        while !st.phase.is_terminal() {
            match deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return Err(AcqError::Timeout);
                    }
                    self.inner.done_cond.wait_for(&mut st, dl - now);
                }
                None => self.inner.done_cond.wait(&mut st),
            }
        }
        Self::terminal_outcome(&st)
    }

    /// Block until terminal, discarding the result value.
    pub fn wait(&self, timeout: Option<Duration>) -> AcqResult<()> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut st = self.inner.state.lock();
        while !st.phase.is_terminal() {
            match deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return Err(AcqError::Timeout);
                    }
                    self.inner.done_cond.wait_for(&mut st, dl - now);
                }
                None => self.inner.done_cond.wait(&mut st),
            }
        }
        match st.phase {
            FuturePhase::Finished => Ok(()),
            FuturePhase::Cancelled => Err(AcqError::Cancelled),
            _ => Err(Self::stored_failure(&st)),
        }
    }

    /// The stored failure, if the future ended Failed or Cancelled.
    pub fn failure(&self) -> Option<AcqError> {
        let st = self.inner.state.lock();
        match st.phase {
            FuturePhase::Failed => Some(Self::stored_failure(&st)),
            FuturePhase::Cancelled => Some(AcqError::Cancelled),
            _ => None,
        }
    }

    // ---- internals -------------------------------------------------------

    fn terminal_outcome(st: &MutexGuard<'_, FutureState<T>>) -> AcqResult<T>
    where
        T: Clone,
    {
        match st.phase {
            FuturePhase::Finished => match st.result.clone() {
                Some(v) => Ok(v),
                // Finished futures always hold a result; keep result() total.
                None => Err(AcqError::Hardware("finished future holds no result".into())),
            },
            FuturePhase::Cancelled => Err(AcqError::Cancelled),
            _ => Err(Self::stored_failure(st)),
        }
    }

    fn stored_failure(st: &MutexGuard<'_, FutureState<T>>) -> AcqError {
        match &st.error {
            Some(err) => AcqError::Task(Arc::clone(err)),
            None => AcqError::Hardware("failed future holds no error".into()),
        }
    }

    /// Drain done callbacks and wake waiters. Caller holds the lock and has
    /// just moved the phase to a terminal state.
    fn drain_terminal(&self, st: &mut MutexGuard<'_, FutureState<T>>) -> Vec<DoneCallback<T>> {
        // The canceller can never fire after a terminal transition.
        st.canceller = None;
        self.inner.done_cond.notify_all();
        std::mem::take(&mut st.done_callbacks)
    }

    fn fire_done(&self, callbacks: Vec<DoneCallback<T>>) {
        for cb in callbacks {
            cb(self);
        }
    }
}

/// Object-safe view of a [`ProgressiveFuture`] for type-erased observation.
///
/// The batch future and the executors track futures of mixed result types
/// through this trait: cancellation, terminal queries, progress remaining and
/// type-erased subscriptions, but never the typed result itself.
pub trait FutureHandle: Send + Sync {
    /// See [`ProgressiveFuture::cancel`].
    fn cancel(&self) -> bool;
    /// Whether the future reached a terminal state.
    fn done(&self) -> bool;
    /// Whether the future is currently running.
    fn running(&self) -> bool;
    /// Whether the future ended cancelled.
    fn cancelled(&self) -> bool;
    /// The stored failure, if the future ended Failed or Cancelled.
    fn failure(&self) -> Option<AcqError>;
    /// Time until the estimated end, zero once terminal.
    fn estimated_remaining(&self) -> Duration;
    /// Block until terminal; Ok for Finished, the failure otherwise.
    fn wait(&self, timeout: Option<Duration>) -> AcqResult<()>;
    /// Subscribe to the terminal transition (fires immediately if already
    /// terminal).
    fn add_done_notify(&self, callback: Box<dyn Fn() + Send + Sync>);
    /// Subscribe to progress updates.
    fn add_progress_notify(&self, callback: Box<dyn Fn() + Send + Sync>);
}

impl<T> FutureHandle for ProgressiveFuture<T>
where
    T: Send + 'static,
{
    fn cancel(&self) -> bool {
        ProgressiveFuture::cancel(self)
    }

    fn done(&self) -> bool {
        ProgressiveFuture::done(self)
    }

    fn running(&self) -> bool {
        ProgressiveFuture::running(self)
    }

    fn cancelled(&self) -> bool {
        ProgressiveFuture::cancelled(self)
    }

    fn failure(&self) -> Option<AcqError> {
        ProgressiveFuture::failure(self)
    }

    fn estimated_remaining(&self) -> Duration {
        ProgressiveFuture::estimated_remaining(self)
    }

    fn wait(&self, timeout: Option<Duration>) -> AcqResult<()> {
        ProgressiveFuture::wait(self, timeout)
    }

    fn add_done_notify(&self, callback: Box<dyn Fn() + Send + Sync>) {
        self.add_done_callback(move |_| callback());
    }

    fn add_progress_notify(&self, callback: Box<dyn Fn() + Send + Sync>) {
        self.add_update_callback(move |_, _, _| callback());
    }
}

/// Convenience: wire a fresh token-based canceller onto a future.
///
/// Returns the token the task body must poll. The canceller signals the
/// token and reports success; the cooperative stop is assumed observed at the
/// task's next checkpoint.
pub fn install_token_canceller<T>(future: &ProgressiveFuture<T>) -> CancellationToken
where
    T: Send + 'static,
{
    let token = CancellationToken::new();
    let signal = token.clone();
    future.set_task_canceller(move |_| {
        signal.cancel();
        true
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_new_future_is_pending() {
        let fut = ProgressiveFuture::<u32>::new();
        assert_eq!(fut.phase(), FuturePhase::Pending);
        assert!(!fut.done());
        assert!(!fut.cancelled());
    }

    #[test]
    fn test_result_roundtrip_idempotent() {
        let fut = ProgressiveFuture::new();
        assert!(fut.set_running_or_notify_cancel());
        fut.set_result(7_u32);
        assert_eq!(fut.result(None).unwrap(), 7);
        // Repeated calls observe the same stored value.
        assert_eq!(fut.result(None).unwrap(), 7);
        assert!(fut.done());
    }

    #[test]
    fn test_failed_future_reraises_stored_error() {
        let fut = ProgressiveFuture::<u32>::new();
        fut.set_running_or_notify_cancel();
        fut.set_exception(anyhow::anyhow!("detector offline"));
        let err = fut.result(None).unwrap_err();
        assert!(matches!(err, AcqError::Task(_)));
        assert!(err.to_string().contains("detector offline"));
        // Idempotent on repeated calls.
        assert!(matches!(fut.result(None).unwrap_err(), AcqError::Task(_)));
    }

    #[test]
    fn test_cancel_pending_never_invokes_canceller() {
        let fut = ProgressiveFuture::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        fut.set_task_canceller(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            true
        });
        assert!(fut.cancel());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(fut.cancelled());
        // A worker arriving late observes the cancellation.
        assert!(!fut.set_running_or_notify_cancel());
        // Re-cancel is idempotent.
        assert!(fut.cancel());
    }

    #[test]
    fn test_cancel_running_invokes_canceller_exactly_once() {
        let fut = ProgressiveFuture::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        fut.set_task_canceller(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            true
        });
        fut.set_running_or_notify_cancel();
        assert!(fut.cancel());
        assert!(fut.cancel()); // idempotent, canceller already consumed
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(fut.cancelled());
        assert!(matches!(fut.result(None).unwrap_err(), AcqError::Cancelled));
    }

    #[test]
    fn test_cancel_respects_canceller_refusal() {
        let fut = ProgressiveFuture::<u32>::new();
        fut.set_task_canceller(|_| false);
        fut.set_running_or_notify_cancel();
        assert!(!fut.cancel());
        assert!(!fut.cancelled());
        assert!(fut.running());
    }

    #[test]
    fn test_cancel_terminal_returns_false() {
        let fut = ProgressiveFuture::new();
        fut.set_running_or_notify_cancel();
        fut.set_result(1_u8);
        assert!(!fut.cancel());
    }

    #[test]
    fn test_result_after_cancel_is_discarded() {
        let fut = ProgressiveFuture::new();
        fut.set_running_or_notify_cancel();
        fut.set_task_canceller(|_| true);
        assert!(fut.cancel());
        fut.set_result(99_u32);
        assert!(matches!(fut.result(None).unwrap_err(), AcqError::Cancelled));
    }

    #[test]
    fn test_done_callback_fires_once_and_late_subscribers_fire_immediately() {
        let fut = ProgressiveFuture::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        fut.add_done_callback(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        fut.set_running_or_notify_cancel();
        fut.set_result(0_u32);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let late = Arc::new(AtomicUsize::new(0));
        let late2 = Arc::clone(&late);
        fut.add_done_callback(move |_| {
            late2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_progress_updates_notify_subscribers() {
        let fut = ProgressiveFuture::<u32>::new();
        let updates = Arc::new(AtomicUsize::new(0));
        let updates2 = Arc::clone(&updates);
        fut.add_update_callback(move |_, start, end| {
            assert!(end >= start);
            updates2.fetch_add(1, Ordering::SeqCst);
        });
        // Callable before Running.
        let now = Instant::now();
        fut.set_progress(Some(now), Some(now + Duration::from_secs(5)));
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert!(fut.estimated_remaining() > Duration::from_secs(4));
    }

    #[test]
    fn test_result_timeout() {
        let fut = ProgressiveFuture::<u32>::new();
        let err = fut.result(Some(Duration::from_millis(10))).unwrap_err();
        assert!(matches!(err, AcqError::Timeout));
    }

    #[test]
    fn test_result_blocks_until_worker_finishes() {
        let fut = ProgressiveFuture::new();
        let worker_fut = fut.clone();
        let handle = std::thread::spawn(move || {
            worker_fut.set_running_or_notify_cancel();
            std::thread::sleep(Duration::from_millis(20));
            worker_fut.set_result(42_u32);
        });
        assert_eq!(fut.result(Some(Duration::from_secs(5))).unwrap(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn test_token_canceller_signals_token() {
        let fut = ProgressiveFuture::<u32>::new();
        let token = install_token_canceller(&fut);
        fut.set_running_or_notify_cancel();
        assert!(!token.is_cancelled());
        assert!(fut.cancel());
        assert!(token.is_cancelled());
    }
}
