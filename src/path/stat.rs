//! Smoothed statistics for noisy path measurements.
//!
//! Uses the RFC 6298 smoothing constants in integer arithmetic:
//! - First sample: VAL = sample, VAR = sample / 2
//! - Subsequent: VAR = 3/4 * VAR + 1/4 * |VAL - sample|
//! - VAL = 7/8 * VAL + 1/8 * sample

use crate::core::STAT_SETUP_SAMPLES;

/// Exponentially weighted mean and mean deviation.
///
/// The estimate is only trustworthy once [`Stat::setup`] is true, i.e. after
/// [`STAT_SETUP_SAMPLES`] samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Smoothed mean.
    pub val: u64,
    /// Smoothed mean absolute deviation.
    pub var: u64,
    /// Whether enough samples were seen to trust the estimate.
    pub setup: bool,
    samples: u32,
}

impl Stat {
    /// Create an empty estimator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a new sample into the estimate.
    pub fn update(&mut self, sample: u64) {
        if self.samples == 0 {
            self.val = sample;
            self.var = sample / 2;
        } else {
            let diff = self.val.abs_diff(sample);
            self.var = (self.var.saturating_mul(3).saturating_add(diff)) / 4;
            self.val = (self.val.saturating_mul(7).saturating_add(sample)) / 8;
        }

        self.samples = self.samples.saturating_add(1);
        self.setup = self.samples >= STAT_SETUP_SAMPLES;
    }

    /// Number of samples folded in since the last reset.
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Upper estimate: mean plus four deviations.
    pub fn upper(&self) -> u64 {
        self.val.saturating_add(self.var.saturating_mul(4))
    }

    /// Forget every sample.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
