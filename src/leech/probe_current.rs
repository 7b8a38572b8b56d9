//! Probe-current sampling leech.
//!
//! Samples the beam current periodically during a raster scan so the
//! intensity of the acquired data can be normalized afterwards. When the
//! current detector sits off the acquisition path, an optional beam-routing
//! selector is engaged around each measurement.
//!
//! Measurement failures are logged and skipped; a missing sample never
//! aborts the host acquisition.

use super::Leech;
use crate::data::{Frame, MD_PROBE_CURRENT};
use crate::error::{AcqError, AcqResult};
use crate::hardware::{BeamSelector, CurrentReader};
use crate::raster::{CheckpointPeriod, ScanShape};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rough duration of one probe-current measurement, used for estimates only.
const MEASUREMENT_TIME_S: f64 = 0.01;

fn default_round_to_lines_over() -> f64 {
    2.0
}

/// Configuration of a [`ProbeCurrentAcquirer`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProbeCurrentSettings {
    /// Target wall-clock period between samples, in seconds.
    pub period_s: f64,
    /// Threshold, in scan lines, above which the sampling interval is
    /// rounded up to a whole number of lines so a checkpoint does not
    /// interrupt the hardware mid-line.
    #[serde(default = "default_round_to_lines_over")]
    pub round_to_lines_over: f64,
}

impl ProbeCurrentSettings {
    /// Settings with the default whole-line rounding threshold.
    pub fn with_period(period_s: f64) -> Self {
        Self {
            period_s,
            round_to_lines_over: default_round_to_lines_over(),
        }
    }

    /// Validate the settings; every error is fatal before hardware use.
    pub fn validate(&self) -> AcqResult<()> {
        if !(self.period_s > 0.0 && self.period_s.is_finite()) {
            return Err(AcqError::Configuration(format!(
                "probe current period must be positive, got {} s",
                self.period_s
            )));
        }
        if !(self.round_to_lines_over >= 0.0) {
            return Err(AcqError::Configuration(
                "line rounding threshold must not be negative".into(),
            ));
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

/// One timestamped current reading.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CurrentSample {
    /// When the reading was taken.
    pub timestamp: DateTime<Utc>,
    /// The reading, in amperes.
    pub amperes: f64,
}

struct ProbeCurrentSeries {
    samples: Vec<CurrentSample>,
    period: Option<CheckpointPeriod>,
}

/// Piggyback probe-current sampling.
pub struct ProbeCurrentAcquirer {
    detector: Arc<dyn CurrentReader>,
    selector: Option<Arc<dyn BeamSelector>>,
    settings: ProbeCurrentSettings,
    series: Option<ProbeCurrentSeries>,
}

impl ProbeCurrentAcquirer {
    /// Bind a current detector and, optionally, a beam-routing selector.
    pub fn new(
        detector: Arc<dyn CurrentReader>,
        selector: Option<Arc<dyn BeamSelector>>,
        settings: ProbeCurrentSettings,
    ) -> Self {
        Self {
            detector,
            selector,
            settings,
            series: None,
        }
    }

    /// The samples accumulated in the current series.
    pub fn samples(&self) -> &[CurrentSample] {
        self.series.as_ref().map_or(&[], |s| s.samples.as_slice())
    }

    /// Take one measurement, toggling the selector around it when present.
    ///
    /// Failures are logged and skipped: the host acquisition proceeds with
    /// one sample fewer.
    fn measure_once(&mut self) {
        let reading = self.read_with_selector();
        match reading {
            Ok(amperes) => {
                if let Some(series) = self.series.as_mut() {
                    debug!(amperes, "probe current sampled");
                    series.samples.push(CurrentSample {
                        timestamp: Utc::now(),
                        amperes,
                    });
                }
            }
            Err(err) => {
                warn!("probe current measurement failed, skipping sample: {err:#}");
            }
        }
    }

    fn read_with_selector(&self) -> anyhow::Result<f64> {
        if let Some(selector) = &self.selector {
            selector.select_detector(true)?;
            // Always restore the beam path, even if the read fails.
            let reading = self.detector.read_current();
            let restore = selector.select_detector(false);
            let amperes = reading?;
            restore?;
            Ok(amperes)
        } else {
            self.detector.read_current()
        }
    }

    fn cadence(&self, step_duration_s: f64, shape: ScanShape) -> AcqResult<CheckpointPeriod> {
        CheckpointPeriod::new(
            self.settings.period_s,
            step_duration_s,
            shape,
            Some(self.settings.round_to_lines_over),
        )
    }
}

impl Leech for ProbeCurrentAcquirer {
    fn name(&self) -> &str {
        "probe-current"
    }

    fn estimate_time(&self, step_duration_s: f64, shape: ScanShape) -> AcqResult<f64> {
        self.settings.validate()?;
        let cadence = self.cadence(step_duration_s, shape)?;
        let checkpoints = cadence.total_checkpoints(shape.pixel_count());
        Ok(checkpoints as f64 * MEASUREMENT_TIME_S)
    }

    fn series_start(&mut self) -> AcqResult<()> {
        self.settings.validate()?;
        self.series = Some(ProbeCurrentSeries {
            samples: Vec::new(),
            period: None,
        });
        info!(period_s = self.settings.period_s, "probe current series started");
        Ok(())
    }

    fn start(&mut self, step_duration_s: f64, shape: ScanShape) -> AcqResult<Option<usize>> {
        if self.series.is_none() {
            return Err(AcqError::Configuration(
                "probe current leech started without series_start".into(),
            ));
        }
        let cadence = self.cadence(step_duration_s, shape)?;
        if let Some(series) = self.series.as_mut() {
            series.period = Some(cadence);
        }
        self.measure_once();
        Ok(Some(cadence.pixels_per_period()))
    }

    fn next(&mut self, _data_so_far: &mut [Frame]) -> AcqResult<Option<usize>> {
        let cadence = self
            .series
            .as_ref()
            .and_then(|s| s.period)
            .ok_or_else(|| {
                AcqError::Configuration("probe current checkpoint before start".into())
            })?;
        self.measure_once();
        Ok(Some(cadence.pixels_per_period()))
    }

    fn complete(&mut self, data: &mut [Frame]) -> AcqResult<()> {
        // Final sample, then attach the whole ordered list to every acquired
        // data item of this run.
        self.measure_once();
        let Some(series) = self.series.as_mut() else {
            return Ok(());
        };
        let annotation = serde_json::to_value(&series.samples)
            .map_err(|e| AcqError::Hardware(format!("serializing samples: {e}")))?;
        for frame in data.iter_mut() {
            frame.set_metadata(MD_PROBE_CURRENT, annotation.clone());
        }
        series.period = None;
        Ok(())
    }

    fn series_complete(&mut self, _data: &mut [Frame]) -> AcqResult<()> {
        if let Some(series) = &self.series {
            info!(samples = series.samples.len(), "probe current series complete");
        }
        self.series = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Mock current detector with configurable reading and failure toggle.
    struct MockPicoammeter {
        amperes: Mutex<f64>,
        fail: AtomicBool,
        reads: AtomicUsize,
    }

    impl MockPicoammeter {
        fn new(amperes: f64) -> Self {
            Self {
                amperes: Mutex::new(amperes),
                fail: AtomicBool::new(false),
                reads: AtomicUsize::new(0),
            }
        }
    }

    impl CurrentReader for MockPicoammeter {
        fn read_current(&self) -> anyhow::Result<f64> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("picoammeter did not answer");
            }
            Ok(*self.amperes.lock())
        }
    }

    /// Mock selector recording the engage/restore sequence.
    #[derive(Default)]
    struct MockSelector {
        log: Mutex<Vec<bool>>,
    }

    impl BeamSelector for MockSelector {
        fn select_detector(&self, engaged: bool) -> anyhow::Result<()> {
            self.log.lock().push(engaged);
            Ok(())
        }
    }

    fn leech_with(
        detector: Arc<MockPicoammeter>,
        selector: Option<Arc<MockSelector>>,
        period_s: f64,
    ) -> ProbeCurrentAcquirer {
        ProbeCurrentAcquirer::new(
            detector,
            selector.map(|s| s as Arc<dyn BeamSelector>),
            ProbeCurrentSettings::with_period(period_s),
        )
    }

    #[test]
    fn test_start_measures_immediately() {
        let detector = Arc::new(MockPicoammeter::new(1.2e-9));
        let mut leech = leech_with(detector.clone(), None, 1.0);
        leech.series_start().unwrap();
        leech.start(1e-3, ScanShape::new(10, 10)).unwrap();
        assert_eq!(detector.reads.load(Ordering::SeqCst), 1);
        assert_eq!(leech.samples().len(), 1);
        assert!((leech.samples()[0].amperes - 1.2e-9).abs() < 1e-15);
    }

    #[test]
    fn test_checkpoint_budget_and_count() {
        let detector = Arc::new(MockPicoammeter::new(1e-9));
        let mut leech = leech_with(detector, None, 0.05);
        leech.series_start().unwrap();
        // 0.05 s at 1e-3 s per pixel: 50 pixels, below the two-line
        // threshold of a 100-pixel-wide scan, so the raw count is kept.
        let budget = leech.start(1e-3, ScanShape::new(100, 100)).unwrap();
        assert_eq!(budget, Some(50));
    }

    #[test]
    fn test_long_period_rounds_to_whole_lines() {
        let detector = Arc::new(MockPicoammeter::new(1e-9));
        let mut leech = leech_with(detector, None, 0.25);
        leech.series_start().unwrap();
        // 250 pixels raw exceeds two 100-pixel lines: rounded up to 300.
        let budget = leech.start(1e-3, ScanShape::new(100, 100)).unwrap();
        assert_eq!(budget, Some(300));
    }

    #[test]
    fn test_selector_toggled_around_measurement() {
        let detector = Arc::new(MockPicoammeter::new(1e-9));
        let selector = Arc::new(MockSelector::default());
        let mut leech = leech_with(detector, Some(selector.clone()), 1.0);
        leech.series_start().unwrap();
        leech.start(1e-3, ScanShape::new(4, 4)).unwrap();
        assert_eq!(*selector.log.lock(), vec![true, false]);
    }

    #[test]
    fn test_complete_attaches_samples_to_every_frame() {
        let detector = Arc::new(MockPicoammeter::new(2.5e-9));
        let mut leech = leech_with(detector, None, 1.0);
        leech.series_start().unwrap();
        leech.start(1e-3, ScanShape::new(4, 4)).unwrap();
        let mut data = vec![
            Frame::from_u16(2, 2, vec![0; 4]),
            Frame::from_u16(2, 2, vec![0; 4]),
        ];
        leech.next(&mut data).unwrap();
        leech.complete(&mut data).unwrap();

        // start + next + complete: three ordered samples on every frame.
        for frame in &data {
            let md = frame.get_metadata(MD_PROBE_CURRENT).unwrap();
            let samples = md.as_array().unwrap();
            assert_eq!(samples.len(), 3);
            assert!((samples[0]["amperes"].as_f64().unwrap() - 2.5e-9).abs() < 1e-15);
        }
    }

    #[test]
    fn test_measurement_failure_is_skipped() {
        let detector = Arc::new(MockPicoammeter::new(1e-9));
        let mut leech = leech_with(detector.clone(), None, 1.0);
        leech.series_start().unwrap();
        leech.start(1e-3, ScanShape::new(4, 4)).unwrap();

        detector.fail.store(true, Ordering::SeqCst);
        let mut data = Vec::new();
        // The failed measurement neither errors nor adds a sample.
        let budget = leech.next(&mut data).unwrap();
        assert!(budget.is_some());
        assert_eq!(leech.samples().len(), 1);

        detector.fail.store(false, Ordering::SeqCst);
        leech.next(&mut data).unwrap();
        assert_eq!(leech.samples().len(), 2);
    }

    #[test]
    fn test_estimate_time_counts_checkpoints() {
        let detector = Arc::new(MockPicoammeter::new(1e-9));
        let leech = leech_with(detector, None, 0.05);
        let shape = ScanShape::new(100, 100);
        // 10000 pixels / 50 per period: 1 + 200 checkpoints.
        let t = leech.estimate_time(1e-3, shape).unwrap();
        assert!((t - 201.0 * MEASUREMENT_TIME_S).abs() < 1e-9);
    }

    #[test]
    fn test_start_without_series_is_configuration_error() {
        let detector = Arc::new(MockPicoammeter::new(1e-9));
        let mut leech = leech_with(detector, None, 1.0);
        assert!(matches!(
            leech.start(1e-3, ScanShape::new(4, 4)),
            Err(AcqError::Configuration(_))
        ));
    }
}
