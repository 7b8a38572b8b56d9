//! Task executors built on [`ProgressiveFuture`].
//!
//! Two flavours, matching how the hardware they front can be shared:
//!
//! - [`SerialTaskExecutor`]: one worker, one task at a time, whole-queue
//!   cancellation. Used where hardware exclusivity makes concurrency
//!   meaningless (a single electron column, a single stage).
//! - [`ParallelConflictExecutor`]: accepts `(resource tags, task)` pairs and
//!   runs tasks concurrently whenever their resource-tag sets are disjoint.
//!   Tasks whose sets intersect are serialized in submission order, each
//!   waiting for every earlier-submitted conflicting task to finish.
//!
//! Task bodies receive the future (to report progress) and a
//! [`CancellationToken`] they must poll between hardware-blocking calls; the
//! installed canceller signals that token. Resource tags are opaque
//! identifiers used purely for conflict detection, never for ownership.

use crate::cancel::CancellationToken;
use crate::error::{AcqError, AcqResult};
use crate::future::{install_token_canceller, FutureHandle, ProgressiveFuture};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A task body: runs on a worker thread, reports progress through the future
/// it is bound to, and polls the token at its checkpoints.
pub type TaskFn<T> =
    Box<dyn FnOnce(&ProgressiveFuture<T>, &CancellationToken) -> anyhow::Result<T> + Send>;

type Job = Box<dyn FnOnce() + Send>;

/// Run one task body to completion on the current thread, honouring the
/// cancellation protocol shared by both executors.
fn run_task<T>(future: &ProgressiveFuture<T>, token: &CancellationToken, task: TaskFn<T>)
where
    T: Clone + Send + 'static,
{
    if !future.set_running_or_notify_cancel() {
        debug!("task skipped: cancelled before start");
        return;
    }
    match task(future, token) {
        Ok(value) => future.set_result(value),
        Err(err) => {
            if token.is_cancelled() {
                // The worker observed the stop signal; the future is already
                // Cancelled and the partial outcome is discarded.
                debug!("task stopped after cancellation: {err:#}");
            } else {
                warn!("task failed: {err:#}");
                future.set_exception(err);
            }
        }
    }
}

// =============================================================================
// SerialTaskExecutor
// =============================================================================

/// Runs one task at a time on a single worker thread.
///
/// `cancel_all` cancels whichever future is currently running (or queued) and
/// drops all queued tasks. The worker observes a queued future's cancelled
/// state and skips it without running the body.
pub struct SerialTaskExecutor {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Futures submitted and not yet pruned; ordered oldest first.
    tracked: Mutex<Vec<Arc<dyn FutureHandle>>>,
}

impl SerialTaskExecutor {
    /// Start the executor and its worker thread.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = std::thread::spawn(move || {
            while let Ok(job) = rx.recv() {
                job();
            }
            debug!("serial executor worker exiting");
        });
        Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            tracked: Mutex::new(Vec::new()),
        }
    }

    /// Submit a task, returning its future.
    pub fn submit<T>(&self, task: TaskFn<T>) -> AcqResult<ProgressiveFuture<T>>
    where
        T: Clone + Send + 'static,
    {
        let future = ProgressiveFuture::<T>::new();
        let token = install_token_canceller(&future);

        let job_future = future.clone();
        let job: Job = Box::new(move || run_task(&job_future, &token, task));

        {
            let sender = self.sender.lock();
            let tx = sender
                .as_ref()
                .ok_or_else(|| AcqError::Configuration("executor has shut down".into()))?;
            tx.send(job)
                .map_err(|_| AcqError::Configuration("executor worker is gone".into()))?;
        }

        let mut tracked = self.tracked.lock();
        tracked.retain(|f| !f.done());
        tracked.push(Arc::new(future.clone()));
        Ok(future)
    }

    /// Cancel the running future and drop every queued task.
    pub fn cancel_all(&self) {
        let snapshot: Vec<Arc<dyn FutureHandle>> = {
            let mut tracked = self.tracked.lock();
            let all = tracked.clone();
            tracked.retain(|f| !f.done());
            all
        };
        info!(count = snapshot.len(), "cancelling all submitted tasks");
        for fut in snapshot {
            fut.cancel();
        }
    }

    /// Stop accepting work and join the worker once the queue drains.
    pub fn shutdown(&self) {
        let tx = self.sender.lock().take();
        drop(tx);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("serial executor worker panicked");
            }
        }
    }
}

impl Default for SerialTaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SerialTaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// ParallelConflictExecutor
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Waiting,
    Running,
    Done,
}

struct TaskEntry {
    id: Uuid,
    tags: BTreeSet<String>,
    status: TaskStatus,
    job: Option<Job>,
    handle: Arc<dyn FutureHandle>,
}

struct SchedState {
    /// Submission-ordered entries; Done entries are pruned lazily.
    tasks: Vec<TaskEntry>,
    workers: Vec<JoinHandle<()>>,
    shutdown: bool,
}

struct ExecInner {
    state: Mutex<SchedState>,
    idle_cond: Condvar,
}

/// Runs tasks in parallel subject to resource-conflict constraints.
///
/// The scheduling decision (run now versus wait for a conflict) is made under
/// a single executor-wide lock at submission time and at each task
/// completion; task bodies run unlocked, each on its own worker thread.
/// Construct one executor per logical hardware system so the "tags currently
/// in use" state stays explicit and instance-owned.
pub struct ParallelConflictExecutor {
    inner: Arc<ExecInner>,
}

impl ParallelConflictExecutor {
    /// Create an empty executor.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ExecInner {
                state: Mutex::new(SchedState {
                    tasks: Vec::new(),
                    workers: Vec::new(),
                    shutdown: false,
                }),
                idle_cond: Condvar::new(),
            }),
        }
    }

    /// Submit a task with the set of resource tags it needs.
    ///
    /// The task starts immediately if no earlier-submitted, not-yet-finished
    /// task shares a tag with it; otherwise it waits for every such task, in
    /// submission order. Cancelling the returned future while it waits
    /// removes it from the queue without blocking unrelated tasks.
    pub fn submit<T>(
        &self,
        resource_tags: BTreeSet<String>,
        task: TaskFn<T>,
    ) -> AcqResult<ProgressiveFuture<T>>
    where
        T: Clone + Send + 'static,
    {
        let future = ProgressiveFuture::<T>::new();
        let token = install_token_canceller(&future);

        let job_future = future.clone();
        let job: Job = Box::new(move || run_task(&job_future, &token, task));

        let id = Uuid::new_v4();
        debug!(task_id = %id, tags = ?resource_tags, "task submitted");

        let mut st = self.inner.state.lock();
        if st.shutdown {
            return Err(AcqError::Configuration("executor has shut down".into()));
        }
        st.tasks.push(TaskEntry {
            id,
            tags: resource_tags,
            status: TaskStatus::Waiting,
            job: Some(job),
            handle: Arc::new(future.clone()),
        });
        Self::schedule(&self.inner, &mut st);
        Ok(future)
    }

    /// Cancel every queued and running future.
    pub fn cancel_all(&self) {
        let snapshot: Vec<Arc<dyn FutureHandle>> = {
            let st = self.inner.state.lock();
            st.tasks.iter().map(|e| Arc::clone(&e.handle)).collect()
        };
        info!(count = snapshot.len(), "cancelling all submitted tasks");
        for fut in snapshot {
            fut.cancel();
        }
        // Sweep cancelled waiters out of the queue so they stop blocking.
        let mut st = self.inner.state.lock();
        Self::schedule(&self.inner, &mut st);
    }

    /// Block until no task is queued or running.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut st = self.inner.state.lock();
        while !st.tasks.is_empty() {
            match deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return false;
                    }
                    self.inner.idle_cond.wait_for(&mut st, dl - now);
                }
                None => self.inner.idle_cond.wait(&mut st),
            }
        }
        true
    }

    /// Stop accepting work, wait for in-flight tasks and join all workers.
    pub fn shutdown(&self) {
        {
            let mut st = self.inner.state.lock();
            st.shutdown = true;
        }
        self.wait_idle(None);
        let workers = {
            let mut st = self.inner.state.lock();
            std::mem::take(&mut st.workers)
        };
        for handle in workers {
            if handle.join().is_err() {
                warn!("parallel executor worker panicked");
            }
        }
    }

    /// Scan the queue and start every task whose conflicts have cleared.
    /// Caller holds the state lock.
    fn schedule(inner: &Arc<ExecInner>, st: &mut SchedState) {
        // A future cancelled while waiting leaves the queue here; it must
        // neither run nor block later tasks.
        for entry in st.tasks.iter_mut() {
            if entry.status == TaskStatus::Waiting && entry.handle.done() {
                debug!(task_id = %entry.id, "queued task cancelled, dropped");
                entry.status = TaskStatus::Done;
                entry.job = None;
            }
        }
        st.tasks.retain(|e| e.status != TaskStatus::Done);

        for i in 0..st.tasks.len() {
            if st.tasks[i].status != TaskStatus::Waiting {
                continue;
            }
            let blocked = (0..i).any(|j| {
                st.tasks[j].status != TaskStatus::Done
                    && !st.tasks[j].tags.is_disjoint(&st.tasks[i].tags)
            });
            if blocked {
                continue;
            }
            st.tasks[i].status = TaskStatus::Running;
            if let Some(job) = st.tasks[i].job.take() {
                let id = st.tasks[i].id;
                debug!(task_id = %id, "task started");
                let inner2 = Arc::clone(inner);
                st.workers.push(std::thread::spawn(move || {
                    job();
                    Self::finish(&inner2, id);
                }));
            }
        }

        if st.tasks.is_empty() {
            inner.idle_cond.notify_all();
        }
    }

    /// Worker epilogue: mark the task done and release its blockees.
    fn finish(inner: &Arc<ExecInner>, id: Uuid) {
        let mut st = inner.state.lock();
        if let Some(entry) = st.tasks.iter_mut().find(|e| e.id == id) {
            entry.status = TaskStatus::Done;
        }
        debug!(task_id = %id, "task finished");
        Self::schedule(inner, &mut st);
    }
}

impl Default for ParallelConflictExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ParallelConflictExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
