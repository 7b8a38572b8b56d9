//! `acq-sched`
//!
//! Acquisition scheduling core for scientific instruments: the machinery
//! that decides *when* a long-running hardware operation may run, how long
//! it is estimated to run, how its cancellation is propagated, and when
//! auxiliary piggyback acquisitions must be invoked during a raster scan.
//! It never decides *what* hardware command to issue; drivers and the
//! acquisition orchestrator sit on top of this crate.
//!
//! ## Building Blocks
//!
//! - [`ProgressiveFuture`]: a cancellable future with a live, mutable
//!   time-to-completion estimate and callback notification.
//! - [`SerialTaskExecutor`] / [`ParallelConflictExecutor`]: run such futures
//!   strictly one-at-a-time-cancellable, or in parallel subject to
//!   resource-conflict constraints.
//! - [`batch_future`]: aggregates N independently-progressing futures into
//!   one future with combined progress and cancellation.
//! - [`next_rectangle`]: the pure scan-chunking helper computing the next
//!   contiguous rectangle of pixels before a checkpoint.
//! - [`Leech`]: the lifecycle contract a piggyback acquisition implements;
//!   [`DriftCorrector`] and [`ProbeCurrentAcquirer`] are the two concrete
//!   strategies.
//!
//! ## Example
//!
//! ```rust,no_run
//! use acq_sched::{ParallelConflictExecutor, TaskFn};
//! use std::collections::BTreeSet;
//!
//! let executor = ParallelConflictExecutor::new();
//! let tags: BTreeSet<String> = ["e-beam".to_string()].into();
//! let task: TaskFn<u32> = Box::new(|_future, token| {
//!     // Poll the token between hardware-blocking calls.
//!     if token.is_cancelled() {
//!         anyhow::bail!("stopped");
//!     }
//!     Ok(42)
//! });
//! let future = executor.submit(tags, task)?;
//! assert_eq!(future.result(None)?, 42);
//! # Ok::<(), acq_sched::AcqError>(())
//! ```

pub mod batch;
pub mod cancel;
pub mod data;
pub mod error;
pub mod executor;
pub mod future;
pub mod hardware;
pub mod leech;
pub mod raster;

pub use batch::{batch_future, BatchPart};
pub use cancel::CancellationToken;
pub use data::{Frame, MD_PROBE_CURRENT, MD_TOTAL_DRIFT};
pub use error::{AcqError, AcqResult};
pub use executor::{ParallelConflictExecutor, SerialTaskExecutor, TaskFn};
pub use future::{FutureHandle, FuturePhase, ProgressiveFuture};
pub use hardware::{AnchorScanner, BeamSelector, CurrentReader, Roi};
pub use leech::drift::{DriftCorrector, DriftCorrectorSettings};
pub use leech::probe_current::{CurrentSample, ProbeCurrentAcquirer, ProbeCurrentSettings};
pub use leech::shift::measure_shift;
pub use leech::{Leech, LeechSet};
pub use raster::{next_rectangle, CheckpointPeriod, ScanShape};
