//! Acceleration-based crash detection.
//!
//! The algorithm is intentionally simple: a sample whose magnitude crosses the
//! impact threshold only counts if the rolling mean of the last few samples
//! also exceeds a lower sustained-deceleration threshold. A dropped phone or a
//! pothole produces one spike and is ignored.
//!
//! The rolling mean includes the spike itself, so suppression has a ceiling:
//! with the defaults (rolling window 5, sustained 15 m/s²) a lone spike above
//! roughly 35.8 m/s² after four readings at rest lifts the mean over the
//! threshold and is reported. Readings with a non-finite component are
//! dropped before they reach the window.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::DetectorConfig;

/// One 3-axis accelerometer reading in m/s².
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelerationSample {
    /// X axis.
    pub x: f64,
    /// Y axis.
    pub y: f64,
    /// Z axis.
    pub z: f64,
    /// When the reading was taken.
    pub timestamp: DateTime<Utc>,
}

impl AccelerationSample {
    /// Create a sample stamped with the current time.
    #[must_use]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self::at(x, y, z, Utc::now())
    }

    /// Create a sample with an explicit timestamp.
    #[must_use]
    pub fn at(x: f64, y: f64, z: f64, timestamp: DateTime<Utc>) -> Self {
        Self { x, y, z, timestamp }
    }

    /// Whether every axis holds a finite value.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.magnitude().is_finite()
    }

    /// Euclidean norm of the acceleration vector.
    #[must_use]
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Signal raised when a sustained impact pattern is seen.
#[derive(Debug, Clone, PartialEq)]
pub struct CrashSuspected {
    /// Timestamp of the sample that crossed the impact threshold.
    pub detected_at: DateTime<Utc>,
    /// Magnitude of that sample.
    pub peak_magnitude: f64,
    /// Rolling mean that confirmed the impact.
    pub rolling_average: f64,
    /// Most recent samples, oldest first, for the diagnostic snapshot.
    pub recent_samples: Vec<AccelerationSample>,
}

/// Sliding-window crash detector.
///
/// After emitting once it stays latched until [`reset`](Self::reset) is
/// called, so one impact cannot raise a signal per sample.
#[derive(Debug)]
pub struct SensorAnomalyDetector {
    config: DetectorConfig,
    window: VecDeque<AccelerationSample>,
    latched: bool,
}

impl SensorAnomalyDetector {
    /// Create a detector with the given thresholds.
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        let window = VecDeque::with_capacity(config.window_size);
        Self {
            config,
            window,
            latched: false,
        }
    }

    /// Feed one sample; returns a signal when a crash is suspected.
    pub fn ingest(&mut self, sample: AccelerationSample) -> Option<CrashSuspected> {
        if !sample.is_finite() {
            warn!(x = sample.x, y = sample.y, z = sample.z, "Dropping non-finite sample");
            return None;
        }
        self.window.push_back(sample);
        while self.window.len() > self.config.window_size {
            self.window.pop_front();
        }

        if self.latched || self.window.len() < self.config.min_samples {
            return None;
        }

        let magnitude = sample.magnitude();
        if magnitude <= self.config.impact_threshold {
            return None;
        }

        let rolling_average = self.rolling_average();
        trace!(magnitude, rolling_average, "Impact candidate");
        if rolling_average <= self.config.sustained_threshold {
            debug!(
                magnitude,
                rolling_average, "Impact spike not sustained, ignoring"
            );
            return None;
        }

        self.latched = true;
        info!(magnitude, rolling_average, "Crash suspected");
        Some(CrashSuspected {
            detected_at: sample.timestamp,
            peak_magnitude: magnitude,
            rolling_average,
            recent_samples: self.recent_samples(),
        })
    }

    /// Re-enable emission once the event raised by this detector is over.
    pub fn reset(&mut self) {
        if self.latched {
            debug!("Crash detector re-armed");
        }
        self.latched = false;
    }

    /// Whether the detector is suppressing further signals.
    #[must_use]
    pub fn is_latched(&self) -> bool {
        self.latched
    }

    /// Number of samples currently held.
    #[must_use]
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Timestamp of the newest sample, if any arrived.
    #[must_use]
    pub fn last_sample_at(&self) -> Option<DateTime<Utc>> {
        self.window.back().map(|s| s.timestamp)
    }

    /// The newest `snapshot_samples` readings, oldest first.
    #[must_use]
    pub fn recent_samples(&self) -> Vec<AccelerationSample> {
        let skip = self.window.len().saturating_sub(self.config.snapshot_samples);
        self.window.iter().skip(skip).copied().collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn rolling_average(&self) -> f64 {
        let n = self.config.rolling_window.min(self.window.len());
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .window
            .iter()
            .rev()
            .take(n)
            .map(AccelerationSample::magnitude)
            .sum();
        sum / n as f64
    }
}
