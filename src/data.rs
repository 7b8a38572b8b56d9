//! Acquired data frames.
//!
//! A [`Frame`] is one 2-D image as exchanged between the scanner hardware
//! seam and the leeches: 16-bit pixels, an acquisition timestamp and a
//! free-form metadata map that leeches annotate (drift vectors, probe-current
//! samples).

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Metadata key for the total drift vector, in scanner pixels `[dx, dy]`.
pub const MD_TOTAL_DRIFT: &str = "total_drift_px";

/// Metadata key for the ordered probe-current sample list.
pub const MD_PROBE_CURRENT: &str = "probe_current_samples";

/// A single acquired image frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Raw pixel data, row-major.
    pub data: Vec<u16>,
    /// Acquisition time.
    pub timestamp: DateTime<Utc>,
    /// Annotations attached by leeches and drivers.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Frame {
    /// Create a frame from 16-bit pixel data, stamped now.
    ///
    /// The pixel vector length must be `width * height`; a mismatch is a
    /// programming error in the driver producing the frame.
    pub fn from_u16(width: u32, height: u32, data: Vec<u16>) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self {
            width,
            height,
            data,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Pixel value at `(x, y)`, or `None` outside the frame.
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get((y * self.width + x) as usize).copied()
    }

    /// Mean pixel value.
    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|&v| u64::from(v)).sum();
        sum as f64 / self.data.len() as f64
    }

    /// Attach or replace a metadata entry.
    pub fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_string(), value);
    }

    /// Look up a metadata entry.
    pub fn get_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }
}
