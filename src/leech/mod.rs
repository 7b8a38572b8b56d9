//! Piggyback acquisitions interleaved into a raster scan.
//!
//! A *leech* is a secondary acquisition strategy that rides along a primary
//! raster scan: the driver pauses the scan at computed pixel checkpoints and
//! gives each leech a chance to measure (re-image an anchor region, sample
//! the probe current) without corrupting the primary scan's pixel geometry.
//!
//! # Lifecycle
//!
//! A driver must call each leech in exactly this sequence:
//!
//! ```text
//! series_start -> { start -> next* -> complete }* -> series_complete
//! ```
//!
//! `series_start`/`series_complete` bracket a whole multi-acquisition run;
//! `start`/`next`/`complete` bracket one leech-bearing acquisition within it.
//! `start` and `next` return how many newly-scanned pixels may elapse before
//! the next checkpoint; the driver honours that budget before calling again
//! (except at the very end of the scan, when fewer pixels remain).
//!
//! Calls are strictly sequential from one driver thread, so implementations
//! need no internal locking.
//!
//! # Failure policy
//!
//! A leech is auxiliary: an error from `next` or `complete` is logged and
//! suppressed by [`LeechSet`] so the host acquisition proceeds. An error from
//! `series_start` or a misconfiguration reported by `estimate_time` is fatal
//! and aborts before any hardware is touched.

pub mod drift;
pub mod probe_current;
pub mod shift;

use crate::data::Frame;
use crate::error::AcqResult;
use crate::raster::ScanShape;
use tracing::{debug, warn};

/// The lifecycle contract a piggyback acquisition strategy implements.
///
/// Between series a leech holds only configuration; transient per-series
/// state is created at `series_start` and discarded at `series_complete`.
pub trait Leech: Send {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Estimate the extra time in seconds this leech adds to one acquisition
    /// of `shape` at `step_duration_s` seconds per pixel.
    ///
    /// Pure: must not touch hardware, callable at any time. A
    /// misconfiguration surfaces here as a `Configuration` error before the
    /// run starts.
    fn estimate_time(&self, step_duration_s: f64, shape: ScanShape) -> AcqResult<f64>;

    /// One-time setup for an entire series (e.g. a baseline measurement).
    fn series_start(&mut self) -> AcqResult<()>;

    /// Begin one leech-bearing acquisition; may itself perform the first
    /// measurement.
    ///
    /// Returns the number of newly-scanned pixels until `next` must be
    /// called, or `None` if the leech need run no more this acquisition.
    fn start(&mut self, step_duration_s: f64, shape: ScanShape) -> AcqResult<Option<usize>>;

    /// Checkpoint: invoked after exactly the promised number of pixels has
    /// been newly captured. May annotate `data_so_far`.
    fn next(&mut self, data_so_far: &mut [Frame]) -> AcqResult<Option<usize>>;

    /// Invoked once the whole acquisition for this stream has finished.
    fn complete(&mut self, data: &mut [Frame]) -> AcqResult<()>;

    /// Invoked once the whole series has finished; tears down series state.
    fn series_complete(&mut self, data: &mut [Frame]) -> AcqResult<()>;
}

/// Per-leech driver bookkeeping inside a [`LeechSet`].
struct LeechEntry {
    leech: Box<dyn Leech>,
    /// Pixels until this leech's next checkpoint; `None` while dormant.
    countdown: Option<usize>,
}

/// The set of leeches active on one acquisition stream, as driven by the
/// scan loop.
///
/// Owns the countdown bookkeeping so the driver only has to ask "how many
/// pixels may I scan before someone is due" and report "this many pixels
/// were scanned". Implements the auxiliary failure policy: checkpoint and
/// completion errors are logged and suppressed, series setup errors are
/// propagated.
#[derive(Default)]
pub struct LeechSet {
    entries: Vec<LeechEntry>,
}

impl LeechSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a leech to the set.
    pub fn push(&mut self, leech: Box<dyn Leech>) {
        self.entries.push(LeechEntry {
            leech,
            countdown: None,
        });
    }

    /// Number of leeches in the set.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set holds no leeches.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the leeches' time estimates for one acquisition.
    ///
    /// Fatal on a `Configuration` error from any leech: misconfiguration
    /// must abort before hardware is touched.
    pub fn estimate_time(&self, step_duration_s: f64, shape: ScanShape) -> AcqResult<f64> {
        let mut total = 0.0;
        for entry in &self.entries {
            total += entry.leech.estimate_time(step_duration_s, shape)?;
        }
        Ok(total)
    }

    /// Run every leech's series setup. Fatal on the first error.
    pub fn series_start(&mut self) -> AcqResult<()> {
        for entry in &mut self.entries {
            entry.leech.series_start()?;
        }
        Ok(())
    }

    /// Begin one acquisition: call every leech's `start` and arm countdowns.
    ///
    /// A `start` failure is logged and the leech left dormant for this
    /// acquisition; the host scan is never aborted by an auxiliary task.
    pub fn start(&mut self, step_duration_s: f64, shape: ScanShape) {
        for entry in &mut self.entries {
            match entry.leech.start(step_duration_s, shape) {
                Ok(countdown) => entry.countdown = countdown,
                Err(err) => {
                    warn!(leech = entry.leech.name(), %err, "leech start failed, dormant for this acquisition");
                    entry.countdown = None;
                }
            }
        }
    }

    /// Pixels until the earliest due checkpoint, or `None` if no leech is
    /// armed. The driver must not scan more than this in one chunk.
    pub fn pixels_until_due(&self) -> Option<usize> {
        self.entries.iter().filter_map(|e| e.countdown).min()
    }

    /// Report that `scanned` pixels were newly captured and run every leech
    /// whose checkpoint is due.
    ///
    /// `scanned` must not exceed [`pixels_until_due`](Self::pixels_until_due)
    /// when any leech is armed; the chunking helper guarantees this in the
    /// scan loop. Checkpoint failures are logged and the failing leech goes
    /// dormant for the rest of the acquisition.
    pub fn advance(&mut self, scanned: usize, data_so_far: &mut [Frame]) {
        for entry in &mut self.entries {
            let Some(countdown) = entry.countdown else {
                continue;
            };
            debug_assert!(scanned <= countdown, "driver overran a leech checkpoint");
            let left = countdown.saturating_sub(scanned);
            if left > 0 {
                entry.countdown = Some(left);
                continue;
            }
            match entry.leech.next(data_so_far) {
                Ok(next) => {
                    debug!(leech = entry.leech.name(), budget = ?next, "leech checkpoint");
                    entry.countdown = next;
                }
                Err(err) => {
                    warn!(leech = entry.leech.name(), %err, "leech checkpoint failed, dormant");
                    entry.countdown = None;
                }
            }
        }
    }

    /// Finish one acquisition: call every leech's `complete` and disarm.
    /// Failures are logged and suppressed.
    pub fn complete(&mut self, data: &mut [Frame]) {
        for entry in &mut self.entries {
            entry.countdown = None;
            if let Err(err) = entry.leech.complete(data) {
                warn!(leech = entry.leech.name(), %err, "leech completion failed");
            }
        }
    }

    /// Finish the series: call every leech's `series_complete`.
    /// Failures are logged and suppressed; teardown always runs for all.
    pub fn series_complete(&mut self, data: &mut [Frame]) {
        for entry in &mut self.entries {
            if let Err(err) = entry.leech.series_complete(data) {
                warn!(leech = entry.leech.name(), %err, "leech series teardown failed");
            }
        }
    }
}
