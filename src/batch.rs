//! Aggregation of independently-progressing futures into one.
//!
//! A batch future has no worker of its own. It is a computed view over its
//! sub-futures plus one lightweight progress-forwarding subscription per
//! sub-future: the aggregate `end` estimate is `now + sum of the remaining
//! estimated duration of each not-yet-done sub-future`, recomputed whenever
//! any sub-future reports new progress.

use crate::future::{FutureHandle, ProgressiveFuture};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// One sub-future with the duration it was originally estimated to take.
/// The original estimate stands in for sub-futures that have not started
/// reporting progress themselves.
pub type BatchPart = (Arc<dyn FutureHandle>, Duration);

struct BatchState {
    parts: Vec<BatchPart>,
}

impl BatchState {
    fn total_remaining(&self) -> Duration {
        let mut total = Duration::ZERO;
        for (fut, estimate) in &self.parts {
            if fut.done() {
                continue;
            }
            total += if fut.running() {
                fut.estimated_remaining()
            } else {
                *estimate
            };
        }
        total
    }
}

/// Aggregate N sub-futures into one future with combined progress and
/// cancellation.
///
/// The returned future is Running from construction (sub-futures are assumed
/// to start independently). Its behaviour:
///
/// - `cancel()` cancels every not-yet-done sub-future; the batch becomes
///   Cancelled iff at least one sub-cancel reported success.
/// - It becomes Finished with a `()` result exactly when every sub-future is
///   terminal and none was cancelled.
/// - If any sub-future failed, that failure is surfaced only once every
///   sub-future has reached a terminal state; siblings are never auto-
///   cancelled because one failed.
pub fn batch_future(parts: Vec<BatchPart>) -> ProgressiveFuture<()> {
    let batch = ProgressiveFuture::<()>::new();
    let state = Arc::new(Mutex::new(BatchState {
        parts: parts.clone(),
    }));

    // Cancellation fans out to every unfinished sub-future. Success means at
    // least one of them actually became cancelled as a direct result.
    {
        let state = Arc::clone(&state);
        batch.set_task_canceller(move |_| {
            let snapshot: Vec<Arc<dyn FutureHandle>> = {
                let st = state.lock();
                st.parts
                    .iter()
                    .filter(|(f, _)| !f.done())
                    .map(|(f, _)| Arc::clone(f))
                    .collect()
            };
            let mut any = false;
            for fut in snapshot {
                if fut.cancel() && fut.cancelled() {
                    any = true;
                }
            }
            debug!(cancelled_any = any, "batch cancellation fanned out");
            any
        });
    }

    batch.set_running_or_notify_cancel();

    // One progress-forwarding subscription per sub-future, plus completion
    // tracking on the done transition.
    for (fut, _) in &parts {
        let batch2 = batch.clone();
        let state2 = Arc::clone(&state);
        fut.add_progress_notify(Box::new(move || {
            recompute_progress(&batch2, &state2);
        }));

        let batch3 = batch.clone();
        let state3 = Arc::clone(&state);
        fut.add_done_notify(Box::new(move || {
            recompute_progress(&batch3, &state3);
            check_completion(&batch3, &state3);
        }));
    }

    recompute_progress(&batch, &state);
    // An empty batch, or one whose sub-futures were already terminal at
    // construction, completes immediately.
    check_completion(&batch, &state);
    batch
}

fn recompute_progress(batch: &ProgressiveFuture<()>, state: &Arc<Mutex<BatchState>>) {
    if batch.done() {
        return;
    }
    let remaining = state.lock().total_remaining();
    batch.set_progress(None, Some(Instant::now() + remaining));
}

fn check_completion(batch: &ProgressiveFuture<()>, state: &Arc<Mutex<BatchState>>) {
    if batch.done() {
        return;
    }
    let (all_done, any_cancelled, first_failure) = {
        let st = state.lock();
        let all_done = st.parts.iter().all(|(f, _)| f.done());
        let any_cancelled = st.parts.iter().any(|(f, _)| f.cancelled());
        let first_failure = st
            .parts
            .iter()
            .filter(|(f, _)| !f.cancelled())
            .find_map(|(f, _)| f.failure());
        (all_done, any_cancelled, first_failure)
    };
    if !all_done {
        return;
    }
    if any_cancelled {
        debug!("batch complete with cancelled sub-future");
        batch.mark_cancelled();
    } else if let Some(err) = first_failure {
        debug!("batch complete, surfacing sub-future failure");
        batch.set_exception(anyhow::Error::new(err));
    } else {
        batch.set_result(());
    }
}
