//! Padded, id-encoded batches and the partitions they come from.

use burn::prelude::*;

use super::tags::TagSet;
use crate::error::{ModelError, Result};
use crate::model::vocab::PAD_ID;

/// One example: source ids, target tags, target ids.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub source: Vec<u32>,
    pub tags: TagSet,
    pub target: Vec<u32>,
}

/// A padded batch of examples, kept on the host until a device asks for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub source: Vec<Vec<u32>>,
    pub tags: Vec<TagSet>,
    pub target: Vec<Vec<u32>>,
}

impl Batch {
    pub fn from_examples(examples: &[Example]) -> Self {
        Batch {
            source: examples.iter().map(|e| e.source.clone()).collect(),
            tags: examples.iter().map(|e| e.tags).collect(),
            target: examples.iter().map(|e| e.target.clone()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }

    /// Ids of one side of every example.
    pub fn words(&self, side: Side) -> &[Vec<u32>] {
        match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        }
    }

    /// `[batch, max_len]` ids of one side.
    pub fn side_tensor<B: Backend>(&self, side: Side, device: &B::Device) -> Result<Tensor<B, 2, Int>> {
        match side {
            Side::Source => self.source_tensor(device),
            Side::Target => self.target_tensor(device),
        }
    }

    /// `[batch, max_len]` source ids, right-padded with 0.
    pub fn source_tensor<B: Backend>(&self, device: &B::Device) -> Result<Tensor<B, 2, Int>> {
        pad_to_tensor(&self.source, device)
    }

    /// `[batch, max_len]` target ids, right-padded with 0.
    pub fn target_tensor<B: Backend>(&self, device: &B::Device) -> Result<Tensor<B, 2, Int>> {
        pad_to_tensor(&self.target, device)
    }
}

/// Right-pad sequences with [`PAD_ID`] into a `[batch, max_len]` tensor.
pub fn pad_to_tensor<B: Backend>(
    sequences: &[Vec<u32>],
    device: &B::Device,
) -> Result<Tensor<B, 2, Int>> {
    let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
    if sequences.is_empty() || max_len == 0 {
        return Err(ModelError::DegenerateBatch("batch has no tokens".into()));
    }
    let mut data = Vec::with_capacity(sequences.len() * max_len);
    for seq in sequences {
        data.extend(seq.iter().map(|&id| id as i32));
        data.extend(std::iter::repeat(PAD_ID as i32).take(max_len - seq.len()));
    }
    Ok(Tensor::from_data(
        TensorData::new(data, [sequences.len(), max_len]),
        device,
    ))
}

/// Which word of an example gets autoencoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

/// Which split of the data a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    LabeledSource,
    LabeledTarget,
    Unlabeled,
    Validation,
    Test,
}

/// Supplier of ready-made batches.
pub trait BatchSource {
    fn batches(&self, partition: Partition) -> &[Batch];

    /// Number of words in a partition.
    fn num_words(&self, partition: Partition) -> usize {
        self.batches(partition).iter().map(Batch::len).sum()
    }
}

/// Group examples into batches of at most `batch_size`, bucketing by
/// target length so padding stays small.
pub fn make_batches(mut examples: Vec<Example>, batch_size: usize) -> Vec<Batch> {
    examples.sort_by_key(|e| e.target.len());
    examples
        .chunks(batch_size.max(1))
        .map(Batch::from_examples)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    fn example(target: Vec<u32>) -> Example {
        Example {
            source: target.clone(),
            tags: TagSet::empty(),
            target,
        }
    }

    #[test]
    fn pads_to_longest_sequence() {
        let device = Default::default();
        let batch = Batch::from_examples(&[example(vec![1, 3, 2]), example(vec![1, 3, 4, 5, 2])]);
        let t = batch.target_tensor::<B>(&device).unwrap();
        assert_eq!(t.dims(), [2, 5]);
        let ids: Vec<i64> = t.into_data().iter::<i64>().collect();
        assert_eq!(ids, vec![1, 3, 2, 0, 0, 1, 3, 4, 5, 2]);
    }

    #[test]
    fn side_selects_source_or_target() {
        let device = Default::default();
        let batch = Batch::from_examples(&[Example {
            source: vec![1, 3, 2],
            tags: TagSet::empty(),
            target: vec![1, 4, 5, 2],
        }]);
        assert_eq!(batch.words(Side::Source), &[vec![1, 3, 2]]);
        assert_eq!(batch.side_tensor::<B>(Side::Source, &device).unwrap().dims(), [1, 3]);
        assert_eq!(batch.side_tensor::<B>(Side::Target, &device).unwrap().dims(), [1, 4]);
    }

    #[test]
    fn empty_batch_is_degenerate() {
        let device = Default::default();
        let err = pad_to_tensor::<B>(&[], &device).unwrap_err();
        assert!(matches!(err, ModelError::DegenerateBatch(_)));
    }

    #[test]
    fn make_batches_respects_size() {
        let examples = (0..5).map(|i| example(vec![1; i + 2])).collect();
        let batches = make_batches(examples, 2);
        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![2, 2, 1]);
    }
}
