//! Raster-scan chunking.
//!
//! Raster-scan hardware can only be triggered along contiguous scan lines, so
//! a scan is paused for leech checkpoints at rectangle boundaries: every
//! chunk is either "the rest of the current line" or "a whole number of
//! lines", never a ragged 2-D block. Repeated application from pixel 0 covers
//! the scan forward-only, gap-free and non-overlapping.

use crate::error::{AcqError, AcqResult};
use serde::{Deserialize, Serialize};

/// A 2-D scan shape, rows by columns, row-major, slowest axis first.
///
/// Additional leading dimensions (repeated detector channels and the like)
/// are flattened away by the caller before chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanShape {
    /// Number of scan lines (slow axis).
    pub ny: usize,
    /// Pixels per scan line (fast axis).
    pub nx: usize,
}

impl ScanShape {
    /// Create a shape from `(ny, nx)`.
    pub fn new(ny: usize, nx: usize) -> Self {
        Self { ny, nx }
    }

    /// Total pixel count `ny * nx`.
    pub fn pixel_count(&self) -> usize {
        self.ny * self.nx
    }
}

/// Compute the next contiguous rectangle of pixels that may be scanned
/// before a checkpoint.
///
/// `current` is the linear index of the next unscanned pixel (row-major) and
/// `max_pixels` the checkpoint budget. Returns `(chunk_ny, chunk_nx)` such
/// that `chunk_ny * chunk_nx <= max_pixels`, the rectangle never extends past
/// the remaining unscanned pixels, and a mid-row position always finishes its
/// row first (`chunk_ny == 1`).
///
/// A zero `max_pixels` is treated as a budget of one pixel so the scan always
/// makes forward progress.
///
/// # Errors
///
/// [`AcqError::OutOfRange`] if `current` is at or past the end of the scan.
pub fn next_rectangle(
    shape: ScanShape,
    current: usize,
    max_pixels: usize,
) -> AcqResult<(usize, usize)> {
    let pixels = shape.pixel_count();
    if current >= pixels {
        return Err(AcqError::OutOfRange { current, pixels });
    }
    let max_pixels = max_pixels.max(1);
    let row = current / shape.nx;
    let col = current % shape.nx;

    if col > 0 {
        // Mid-row: finish the current line first.
        return Ok((1, max_pixels.min(shape.nx - col)));
    }
    if max_pixels < shape.nx {
        // Budget smaller than a line: a partial row.
        return Ok((1, max_pixels.min(shape.nx)));
    }
    // As many full lines as the budget and the remaining scan allow.
    Ok(((max_pixels / shape.nx).min(shape.ny - row), shape.nx))
}

/// The checkpoint cadence of one acquisition: how many newly-scanned pixels
/// may elapse between leech calls.
///
/// Replaces the infinite pixel-count sequence of the lifecycle contract with
/// explicit state: a fixed per-period pixel budget, computed once per
/// acquisition from the configured wall-clock period and the per-pixel step
/// duration, optionally rounded up to whole scan lines so a checkpoint does
/// not interrupt the hardware mid-line.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointPeriod {
    pixels_per_period: usize,
}

impl CheckpointPeriod {
    /// Derive the cadence for one acquisition.
    ///
    /// `round_to_lines_over` is a threshold in scan lines: when the raw
    /// per-period pixel budget exceeds that many lines, it is rounded up to a
    /// whole number of lines. Pass `None` to keep the raw pixel count.
    ///
    /// # Errors
    ///
    /// [`AcqError::Configuration`] if `period_s` is not positive or
    /// `step_duration_s` is not a positive finite number.
    pub fn new(
        period_s: f64,
        step_duration_s: f64,
        shape: ScanShape,
        round_to_lines_over: Option<f64>,
    ) -> AcqResult<Self> {
        if !(period_s > 0.0) {
            return Err(AcqError::Configuration(format!(
                "checkpoint period must be positive, got {period_s} s"
            )));
        }
        if !(step_duration_s > 0.0 && step_duration_s.is_finite()) {
            return Err(AcqError::Configuration(format!(
                "step duration must be positive, got {step_duration_s} s"
            )));
        }

        let mut pixels = ((period_s / step_duration_s) as usize).max(1);
        if let Some(threshold_lines) = round_to_lines_over {
            if shape.nx > 0 && pixels as f64 > threshold_lines * shape.nx as f64 {
                pixels = pixels.div_ceil(shape.nx) * shape.nx;
            }
        }
        Ok(Self {
            pixels_per_period: pixels,
        })
    }

    /// The per-period pixel budget.
    pub fn pixels_per_period(&self) -> usize {
        self.pixels_per_period
    }

    /// The next checkpoint budget given how many pixels remain unscanned.
    ///
    /// Returns `None` once the scan is exhausted; at the very end of the scan
    /// the budget is clamped to what remains.
    pub fn next_checkpoint(&self, remaining: usize) -> Option<usize> {
        if remaining == 0 {
            None
        } else {
            Some(self.pixels_per_period.min(remaining))
        }
    }

    /// Total number of leech calls over a scan: the initial `start` call plus
    /// one `next` per full or partial period.
    pub fn total_checkpoints(&self, total_pixels: usize) -> usize {
        1 + total_pixels.div_ceil(self.pixels_per_period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_scan_in_one_chunk() {
        let shape = ScanShape::new(4, 4);
        assert_eq!(next_rectangle(shape, 0, 16).unwrap(), (4, 4));
    }

    #[test]
    fn test_mid_row_finishes_line_first() {
        // current=5 in a 4x4 scan is row 1, col 1; budget 3 fits the rest of
        // the line exactly.
        let shape = ScanShape::new(4, 4);
        assert_eq!(next_rectangle(shape, 5, 3).unwrap(), (1, 3));
        // A larger budget is still clamped to the end of the line.
        assert_eq!(next_rectangle(shape, 5, 100).unwrap(), (1, 3));
    }

    #[test]
    fn test_partial_row_when_budget_below_line() {
        let shape = ScanShape::new(4, 8);
        assert_eq!(next_rectangle(shape, 0, 5).unwrap(), (1, 5));
    }

    #[test]
    fn test_full_rows_clamped_to_scan_end() {
        let shape = ScanShape::new(4, 4);
        // Budget for 3 lines starting at the last line yields one line.
        assert_eq!(next_rectangle(shape, 12, 12).unwrap(), (1, 4));
        // Budget beyond the whole scan yields all remaining lines.
        assert_eq!(next_rectangle(shape, 4, 1000).unwrap(), (3, 4));
    }

    #[test]
    fn test_out_of_range_position() {
        let shape = ScanShape::new(4, 4);
        assert!(matches!(
            next_rectangle(shape, 16, 4),
            Err(AcqError::OutOfRange {
                current: 16,
                pixels: 16
            })
        ));
    }

    #[test]
    fn test_zero_budget_still_advances() {
        let shape = ScanShape::new(2, 3);
        assert_eq!(next_rectangle(shape, 0, 0).unwrap(), (1, 1));
    }

    /// Repeated application from pixel 0 covers the scan exactly, row-major,
    /// with no gap and no overlap, for a sweep of budgets and shapes.
    #[test]
    fn test_repeated_chunking_covers_scan_exactly() {
        for &(ny, nx) in &[(1, 1), (1, 7), (4, 4), (5, 3), (3, 8), (7, 5)] {
            let shape = ScanShape::new(ny, nx);
            for max_pixels in 1..=(ny * nx + 2) {
                let mut current = 0;
                while current < shape.pixel_count() {
                    let (dy, dx) = next_rectangle(shape, current, max_pixels).unwrap();
                    assert!(dy >= 1 && dx >= 1);
                    assert!(dy * dx <= max_pixels);
                    assert!(current + dy * dx <= shape.pixel_count());
                    if current % nx != 0 {
                        assert_eq!(dy, 1, "mid-row chunk must stay on its line");
                    }
                    if dy > 1 {
                        assert_eq!(dx, nx, "multi-line chunk must span whole lines");
                    }
                    current += dy * dx;
                }
                assert_eq!(current, shape.pixel_count());
            }
        }
    }

    #[test]
    fn test_checkpoint_period_raw_pixels() {
        let shape = ScanShape::new(10, 10);
        // 1 s period at 0.1 s per pixel: 10 pixels per checkpoint.
        let period = CheckpointPeriod::new(1.0, 0.1, shape, None).unwrap();
        assert_eq!(period.pixels_per_period(), 10);
        assert_eq!(period.next_checkpoint(100), Some(10));
        assert_eq!(period.next_checkpoint(4), Some(4));
        assert_eq!(period.next_checkpoint(0), None);
    }

    #[test]
    fn test_checkpoint_period_minimum_one_pixel() {
        let shape = ScanShape::new(10, 10);
        // Period shorter than one pixel still advances one pixel at a time.
        let period = CheckpointPeriod::new(1e-6, 0.1, shape, None).unwrap();
        assert_eq!(period.pixels_per_period(), 1);
    }

    #[test]
    fn test_checkpoint_period_rounds_to_whole_lines() {
        let shape = ScanShape::new(100, 64);
        // 250 pixels is above the two-line threshold of 128, so it is
        // rounded up to 256 = 4 whole lines.
        let period = CheckpointPeriod::new(250.0, 1.0, shape, Some(2.0)).unwrap();
        assert_eq!(period.pixels_per_period(), 256);

        // Below the threshold the raw count is kept.
        let period = CheckpointPeriod::new(100.0, 1.0, shape, Some(2.0)).unwrap();
        assert_eq!(period.pixels_per_period(), 100);
    }

    #[test]
    fn test_checkpoint_period_total_checkpoints() {
        let shape = ScanShape::new(10, 10);
        let period = CheckpointPeriod::new(3.0, 0.1, shape, None).unwrap();
        assert_eq!(period.pixels_per_period(), 30);
        // start + ceil(100 / 30) = 1 + 4.
        assert_eq!(period.total_checkpoints(shape.pixel_count()), 5);
    }

    #[test]
    fn test_checkpoint_period_rejects_bad_config() {
        let shape = ScanShape::new(4, 4);
        assert!(CheckpointPeriod::new(0.0, 0.1, shape, None).is_err());
        assert!(CheckpointPeriod::new(1.0, 0.0, shape, None).is_err());
        assert!(CheckpointPeriod::new(1.0, f64::NAN, shape, None).is_err());
    }
}
