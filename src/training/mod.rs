//! Losses, KL annealing, code-usage ledgers and the training loop.

pub mod config;
pub mod ledger;
pub mod loss;
pub mod schedule;
pub mod trainer;

pub use config::TrainingConfig;
pub use trainer::{fit, FitSummary};
