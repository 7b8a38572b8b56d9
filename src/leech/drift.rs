//! Drift-correction leech.
//!
//! Repeatedly re-images a small fixed *anchor region* during a raster scan
//! and tracks how far the stage/beam has drifted since the scan began. The
//! compensation itself is applied by the caller (translating the position
//! metadata of concurrently-acquired data); this leech only measures and
//! exposes the vectors, all in scanner-pixel units.

use super::shift::measure_shift;
use super::Leech;
use crate::data::{Frame, MD_TOTAL_DRIFT};
use crate::error::{AcqError, AcqResult};
use crate::hardware::{AnchorScanner, Roi};
use crate::raster::{CheckpointPeriod, ScanShape};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// How many raw anchor frames are retained for inspection.
const ANCHOR_HISTORY_DEPTH: usize = 4;

/// Configuration of a [`DriftCorrector`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DriftCorrectorSettings {
    /// The anchor region to re-image, in scanner pixels.
    pub roi: Roi,
    /// Dwell time per anchor pixel, in seconds.
    pub dwell_time_s: f64,
    /// Target wall-clock period between anchor captures, in seconds.
    pub period_s: f64,
}

impl DriftCorrectorSettings {
    /// Validate the settings; every error is fatal before hardware use.
    pub fn validate(&self) -> AcqResult<()> {
        if self.roi.is_empty() {
            return Err(AcqError::Configuration(
                "drift correction requires a non-empty anchor region".into(),
            ));
        }
        if !(self.dwell_time_s > 0.0 && self.dwell_time_s.is_finite()) {
            return Err(AcqError::Configuration(format!(
                "anchor dwell time must be positive, got {} s",
                self.dwell_time_s
            )));
        }
        if !(self.period_s > 0.0 && self.period_s.is_finite()) {
            return Err(AcqError::Configuration(format!(
                "drift period must be positive, got {} s",
                self.period_s
            )));
        }
        Ok(())
    }

    /// Parse settings from a TOML document.
    pub fn from_toml_str(s: &str) -> AcqResult<Self> {
        let settings: Self =
            toml::from_str(s).map_err(|e| AcqError::Configuration(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Transient state of one series, created at `series_start` and discarded at
/// `series_complete`.
struct DriftSeries {
    /// The very first anchor capture, reference for `tot_drift`.
    first_anchor: Frame,
    /// Retained raw anchor frames, newest last, bounded depth.
    history: Vec<Frame>,
    /// When the newest anchor was captured.
    last_capture: Instant,
    /// Drift since the previous checkpoint.
    drift: (f64, f64),
    /// Drift since the first capture.
    tot_drift: (f64, f64),
    /// Largest drift magnitude seen this series.
    max_drift: f64,
    /// Checkpoint cadence of the current acquisition.
    period: Option<CheckpointPeriod>,
}

/// Piggyback drift measurement over an anchor region.
pub struct DriftCorrector {
    scanner: Arc<dyn AnchorScanner>,
    settings: DriftCorrectorSettings,
    series: Option<DriftSeries>,
}

impl DriftCorrector {
    /// Bind a scanner/detector pair and the anchor configuration.
    pub fn new(scanner: Arc<dyn AnchorScanner>, settings: DriftCorrectorSettings) -> Self {
        Self {
            scanner,
            settings,
            series: None,
        }
    }

    /// Drift since the previous checkpoint, if a series is active.
    pub fn drift(&self) -> Option<(f64, f64)> {
        self.series.as_ref().map(|s| s.drift)
    }

    /// Accumulated drift since the first anchor capture.
    pub fn tot_drift(&self) -> Option<(f64, f64)> {
        self.series.as_ref().map(|s| s.tot_drift)
    }

    /// Largest drift magnitude seen this series.
    pub fn max_drift(&self) -> Option<f64> {
        self.series.as_ref().map(|s| s.max_drift)
    }

    /// The retained raw anchor frames, newest last.
    pub fn anchor_frames(&self) -> &[Frame] {
        self.series.as_ref().map_or(&[], |s| s.history.as_slice())
    }

    /// Expected duration of one anchor capture, in seconds.
    fn capture_time(&self) -> f64 {
        self.settings.roi.pixel_count() as f64 * self.settings.dwell_time_s
    }

    fn capture_anchor(&self) -> AcqResult<Frame> {
        self.scanner
            .capture(&self.settings.roi, self.settings.dwell_time_s)
            .map_err(|e| AcqError::hardware(&e))
    }

    /// Re-capture the anchor and update the drift vectors.
    fn measure(&mut self) -> AcqResult<()> {
        let fresh = self.capture_anchor()?;
        let series = self
            .series
            .as_mut()
            .ok_or_else(|| AcqError::Configuration("drift series not started".into()))?;
        let previous = series.history.last().unwrap_or(&series.first_anchor);
        series.drift = measure_shift(previous, &fresh)?;
        series.tot_drift = measure_shift(&series.first_anchor, &fresh)?;
        let magnitude = (series.tot_drift.0.powi(2) + series.tot_drift.1.powi(2)).sqrt();
        if magnitude > series.max_drift {
            series.max_drift = magnitude;
        }
        debug!(
            drift = ?series.drift,
            tot_drift = ?series.tot_drift,
            max_drift = series.max_drift,
            "anchor drift measured"
        );
        series.last_capture = Instant::now();
        series.history.push(fresh);
        if series.history.len() > ANCHOR_HISTORY_DEPTH {
            series.history.remove(0);
        }
        Ok(())
    }

    /// Derive the checkpoint cadence from the configured period and the two
    /// fastest axes of the scan.
    fn cadence(&self, step_duration_s: f64, shape: ScanShape) -> AcqResult<CheckpointPeriod> {
        CheckpointPeriod::new(self.settings.period_s, step_duration_s, shape, None)
    }
}

impl Leech for DriftCorrector {
    fn name(&self) -> &str {
        "drift-correction"
    }

    fn estimate_time(&self, step_duration_s: f64, shape: ScanShape) -> AcqResult<f64> {
        self.settings.validate()?;
        let cadence = self.cadence(step_duration_s, shape)?;
        let checkpoints = cadence.total_checkpoints(shape.pixel_count());
        Ok(checkpoints as f64 * self.capture_time())
    }

    fn series_start(&mut self) -> AcqResult<()> {
        self.settings.validate()?;
        let first = self.capture_anchor()?;
        info!(
            roi = ?self.settings.roi,
            period_s = self.settings.period_s,
            "drift series started, anchor captured"
        );
        self.series = Some(DriftSeries {
            first_anchor: first,
            history: Vec::new(),
            last_capture: Instant::now(),
            drift: (0.0, 0.0),
            tot_drift: (0.0, 0.0),
            max_drift: 0.0,
            period: None,
        });
        Ok(())
    }

    fn start(&mut self, step_duration_s: f64, shape: ScanShape) -> AcqResult<Option<usize>> {
        if self.series.is_none() {
            return Err(AcqError::Configuration(
                "drift leech started without series_start".into(),
            ));
        }
        let cadence = self.cadence(step_duration_s, shape)?;
        let age = self
            .series
            .as_ref()
            .map_or(f64::INFINITY, |s| s.last_capture.elapsed().as_secs_f64());
        // A fresh anchor makes an immediate re-measurement redundant.
        if age >= self.settings.period_s {
            self.measure()?;
        } else {
            debug!(age_s = age, "anchor still fresh, skipping first checkpoint");
        }
        if let Some(series) = self.series.as_mut() {
            series.period = Some(cadence);
        }
        Ok(Some(cadence.pixels_per_period()))
    }

    fn next(&mut self, _data_so_far: &mut [Frame]) -> AcqResult<Option<usize>> {
        let cadence = self
            .series
            .as_ref()
            .and_then(|s| s.period)
            .ok_or_else(|| AcqError::Configuration("drift leech checkpoint before start".into()))?;
        self.measure()?;
        Ok(Some(cadence.pixels_per_period()))
    }

    fn complete(&mut self, data: &mut [Frame]) -> AcqResult<()> {
        let Some(series) = self.series.as_mut() else {
            return Ok(());
        };
        let (dx, dy) = series.tot_drift;
        for frame in data.iter_mut() {
            frame.set_metadata(MD_TOTAL_DRIFT, serde_json::json!([dx, dy]));
        }
        series.period = None;
        Ok(())
    }

    fn series_complete(&mut self, _data: &mut [Frame]) -> AcqResult<()> {
        if let Some(series) = &self.series {
            info!(
                tot_drift = ?series.tot_drift,
                max_drift = series.max_drift,
                "drift series complete"
            );
        }
        self.series = None;
        Ok(())
    }
}
