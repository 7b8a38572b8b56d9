//! Error types for the acquisition scheduling core.
//!
//! All fallible operations in this crate return [`AcqError`]. The taxonomy
//! mirrors how failures propagate through the scheduler:
//!
//! - **`Cancelled`**: not a failure. It is the normal terminal outcome of a
//!   successfully cancelled future, surfaced by `ProgressiveFuture::result`.
//! - **`Configuration`**: semantic misconfiguration (undefined anchor region,
//!   non-positive dwell time). Raised before any hardware is touched and
//!   always fatal for the operation that hit it.
//! - **`Hardware`**: an instrument-level failure from within a task or leech
//!   body. Whether it aborts anything depends on the caller: task errors are
//!   stored on the owning future, leech checkpoint errors are logged and
//!   suppressed by [`crate::leech::LeechSet`].
//! - **`Task`**: the stored failure of a future, preserving the full error
//!   chain the task body returned.
//! - **`OutOfRange`**: precondition violation in the scan chunking helper.
//! - **`Timeout`**: a bounded wait on a future elapsed before the future
//!   reached a terminal state.

use std::sync::Arc;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// Primary error type for the acquisition scheduling core.
#[derive(Error, Debug, Clone)]
pub enum AcqError {
    /// The operation was cancelled.
    ///
    /// This is the expected result of a successful `cancel()`, not a fault.
    /// Callers waiting on a future should treat it as a clean stop.
    #[error("operation cancelled")]
    Cancelled,

    /// Semantic configuration error, raised before hardware use.
    ///
    /// Examples: a drift-correction leech with an empty anchor region, a
    /// checkpoint period that is not a positive number of seconds.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An instrument failed during a task or leech body.
    #[error("hardware error: {0}")]
    Hardware(String),

    /// The stored failure of a task, re-surfaced by `result()`.
    ///
    /// Wraps the error chain returned by the task body. Shared so that
    /// repeated `result()` calls observe the same failure.
    #[error("task failed: {0}")]
    Task(Arc<anyhow::Error>),

    /// Scan position precondition violation in the chunking helper.
    #[error("scan position {current} is outside the scan of {pixels} pixels")]
    OutOfRange {
        /// The linear pixel index that was requested.
        current: usize,
        /// Total pixel count of the scan shape.
        pixels: usize,
    },

    /// A bounded wait elapsed before the future completed.
    #[error("timed out waiting for result")]
    Timeout,
}

impl AcqError {
    /// Wrap a hardware-seam failure (`anyhow` chain) as a `Hardware` error.
    pub fn hardware(err: &anyhow::Error) -> Self {
        AcqError::Hardware(format!("{err:#}"))
    }
}
