//! KL annealing schedule.

use serde::{Deserialize, Serialize};

/// KL weight as a function of the global update count: zero through the
/// warmup, then a linear ramp up to `max`, then constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KlSchedule {
    pub max: f64,
    pub warmup: u64,
    /// Updates after the warmup needed to reach `max`.
    pub ramp: u64,
}

impl KlSchedule {
    /// Schedule with the default warmup of 3000 updates and a ramp of
    /// `max * 150000` updates.
    pub fn new(max: f64) -> Self {
        Self {
            max,
            warmup: 3000,
            ramp: (max * 150_000.0).round().max(1.0) as u64,
        }
    }

    pub fn weight(&self, update: u64) -> f64 {
        if update <= self.warmup {
            return 0.0;
        }
        let progress = (update - self.warmup) as f64 / self.ramp.max(1) as f64;
        (self.max * progress).min(self.max)
    }
}
