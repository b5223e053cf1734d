//! Optimisation and bookkeeping settings of a training run.

use burn::config::Config;

use super::loss::Reduction;
use super::schedule::KlSchedule;
use crate::inference::DecodePolicy;

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 300)]
    pub epochs: usize,
    #[config(default = 128)]
    pub batch_size: usize,
    #[config(default = 1e-3)]
    pub lr: f64,
    #[config(default = 0.0)]
    pub weight_decay: f64,
    /// Gradient clipping norm.
    #[config(default = 5.0)]
    pub grad_clip: f32,
    #[config(default = 0)]
    pub seed: u64,
    /// Final KL weight.
    #[config(default = 0.1)]
    pub kl_max: f64,
    /// Updates with zero KL weight.
    #[config(default = 3000)]
    pub kl_warmup: u64,
    #[config(default = "Reduction::Sum")]
    pub reduction: Reduction,
    /// Run the shared task and keep an epoch checkpoint this often.
    #[config(default = 5)]
    pub shared_task_every: usize,
    /// Write the code-tuple dump this often.
    #[config(default = 10)]
    pub dump_every: usize,
    /// Cap on validation lines.
    #[config(default = 1000)]
    pub max_valid: usize,
    /// Decoding used by the shared task.
    #[config(default = "DecodePolicy::Greedy { max_len: 50 }")]
    pub decode: DecodePolicy,
}

impl TrainingConfig {
    pub fn kl_schedule(&self) -> KlSchedule {
        KlSchedule {
            warmup: self.kl_warmup,
            ..KlSchedule::new(self.kl_max)
        }
    }

    /// Whether `epoch` (1-based) falls on a multiple of `every`.
    pub(crate) fn due(epoch: usize, every: usize) -> bool {
        every > 0 && epoch % every == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_run() {
        let config = TrainingConfig::new();
        assert_eq!(config.epochs, 300);
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.reduction, Reduction::Sum);
        let schedule = config.kl_schedule();
        assert_eq!(schedule.warmup, 3000);
        assert_eq!(schedule.ramp, 15_000);
    }

    #[test]
    fn cadence_skips_zero() {
        assert!(TrainingConfig::due(10, 5));
        assert!(!TrainingConfig::due(7, 5));
        assert!(!TrainingConfig::due(5, 0));
    }
}
