//! Peak sustained throughput of a segment.

use std::time::Duration;

use indicatif::HumanBytes;

use super::sink::{Decorator, Statistics};

/// Placeholder rendered when no sample was ever taken.
pub const PEAK_UNAVAILABLE: &str = "N/A";

/// Smoothing age of the moving average (in samples).
const EWMA_AGE: f64 = 16.0;

/// Samples averaged plainly before exponential smoothing kicks in.
const WARMUP_SAMPLES: u32 = 10;

/// Exponentially weighted moving average with a warm-up phase.
///
/// The first [`WARMUP_SAMPLES`] samples are summed and reads return 0.0;
/// the next sample seeds the average with their mean and smoothing starts.
#[derive(Debug, Clone, Default)]
struct MovingAverage {
    value: f64,
    count: u32,
}

impl MovingAverage {
    fn add(&mut self, sample: f64) {
        let alpha = 2.0 / (EWMA_AGE + 1.0);
        if self.count < WARMUP_SAMPLES {
            self.count += 1;
            self.value += sample;
        } else if self.count == WARMUP_SAMPLES {
            self.count += 1;
            let seed = self.value / f64::from(WARMUP_SAMPLES);
            self.value = sample * alpha + seed * (1.0 - alpha);
        } else {
            self.value = sample * alpha + self.value * (1.0 - alpha);
        }
    }

    fn value(&self) -> f64 {
        if self.count <= WARMUP_SAMPLES {
            0.0
        } else {
            self.value
        }
    }
}

/// Tracks the lowest smoothed duration-per-byte seen during a transfer and
/// freezes it as a speed string when the transfer completes.
#[derive(Debug, Clone, Default)]
pub struct PeakEstimator {
    mean: MovingAverage,
    min_nanos_per_byte: f64,
    frozen: Option<String>,
}

impl PeakEstimator {
    /// Creates an estimator with no samples.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a sample of `bytes` that took `elapsed` to arrive.
    #[allow(clippy::cast_precision_loss)]
    pub fn add_sample(&mut self, bytes: u64, elapsed: Duration) {
        if bytes == 0 {
            return;
        }
        self.observe_mean();
        self.mean.add(elapsed.as_nanos() as f64 / bytes as f64);
    }

    /// Best speed so far in bytes per second, if any sample was taken.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn peak_bytes_per_sec(&self) -> Option<u64> {
        let best = self.best_nanos_per_byte();
        (best > 0.0).then(|| (1e9 / best).round() as u64)
    }

    /// The frozen display value, once completed.
    #[must_use]
    pub fn frozen(&self) -> Option<&str> {
        self.frozen.as_deref()
    }

    fn observe_mean(&mut self) {
        let current = self.mean.value();
        if current > 0.0 && (self.min_nanos_per_byte == 0.0 || current < self.min_nanos_per_byte)
        {
            self.min_nanos_per_byte = current;
        }
    }

    fn best_nanos_per_byte(&self) -> f64 {
        let current = self.mean.value();
        if current > 0.0 && (self.min_nanos_per_byte == 0.0 || current < self.min_nanos_per_byte)
        {
            current
        } else {
            self.min_nanos_per_byte
        }
    }

    fn freeze(&mut self) -> String {
        self.observe_mean();
        match self.peak_bytes_per_sec() {
            Some(speed) => format!("{}/s", HumanBytes(speed)),
            None => PEAK_UNAVAILABLE.to_string(),
        }
    }
}

impl Decorator for PeakEstimator {
    fn render(&mut self, stats: &Statistics) -> String {
        if stats.completed && self.frozen.is_none() {
            self.frozen = Some(self.freeze());
        }
        self.frozen.clone().unwrap_or_default()
    }

    fn ingest(&mut self, bytes: u64, elapsed: Duration) {
        self.add_sample(bytes, elapsed);
    }
}
