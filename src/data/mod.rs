//! Tag sets, batches and the corpus reader.

pub mod batch;
pub mod corpus;
pub mod tags;

pub use batch::{Batch, BatchSource, Example, Partition, Side};
pub use tags::{TagKind, TagSet, TagValue, NUM_TAG_KINDS};
