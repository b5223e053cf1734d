//! Character-level VQ variational encoder-decoder for morphological
//! reinflection.
//!
//! A word is encoded into a continuous root latent and a tuple of discrete
//! suffix codes, one per codebook. Reinflection keeps the root of a source
//! word and swaps in the codes of a target form or target tags.

pub mod checkpoint;
pub mod context;
pub mod data;
pub mod error;
pub mod inference;
pub mod model;
pub mod training;

pub use context::ComputeContext;
pub use data::corpus::{Corpus, CorpusPaths, LabeledLine};
pub use data::tags::{TagKind, TagSet, TagValue, TagVocabs};
pub use error::{ModelError, Result};
pub use inference::DecodePolicy;
pub use model::{ReinflectionConfig, ReinflectionModel, Vocab};
pub use training::TrainingConfig;
