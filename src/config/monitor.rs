//! Load monitor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for [`LoadMonitor`](crate::core::monitor::LoadMonitor).
///
/// Utilization is the highest `(allocated + reserved) / capacity` across all
/// pools. The ceiling only moves after `stable_samples` consecutive samples on
/// the same side of a watermark, then holds for `cooldown_samples` samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling interval in milliseconds.
    pub interval_ms: u64,
    /// Utilization at or below which the ceiling may be raised.
    pub low_watermark: f64,
    /// Utilization at or above which the ceiling is lowered.
    pub high_watermark: f64,
    /// Lowest ceiling the monitor will set.
    pub min_concurrency: usize,
    /// Highest ceiling the monitor will set.
    pub max_concurrency: usize,
    /// Consecutive samples required before acting.
    pub stable_samples: u32,
    /// Samples to wait after a change before acting again.
    pub cooldown_samples: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            low_watermark: 0.5,
            high_watermark: 0.9,
            min_concurrency: 1,
            max_concurrency: 32,
            stable_samples: 3,
            cooldown_samples: 5,
        }
    }
}

impl MonitorConfig {
    /// Sampling interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_ms == 0 {
            return Err("interval_ms must be greater than 0".into());
        }
        if !(0.0..=1.0).contains(&self.low_watermark) || !(0.0..=1.0).contains(&self.high_watermark) {
            return Err("watermarks must be within [0, 1]".into());
        }
        if self.low_watermark >= self.high_watermark {
            return Err("low_watermark must be below high_watermark".into());
        }
        if self.min_concurrency == 0 {
            return Err("min_concurrency must be greater than 0".into());
        }
        if self.min_concurrency > self.max_concurrency {
            return Err("min_concurrency must not exceed max_concurrency".into());
        }
        if self.stable_samples == 0 {
            return Err("stable_samples must be greater than 0".into());
        }
        Ok(())
    }
}
