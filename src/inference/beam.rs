//! Beam search over the attention decoder.
//!
//! Hypotheses live in an arena: every expansion appends a node holding its
//! token, cumulative log-probability and the arena index of its parent.
//! Live hypotheses are expanded together as one batch.

use burn::prelude::*;
use tracing::debug;

use crate::error::{ModelError, Result};
use crate::model::decoder::{AttentionDecoder, DecoderMemory};
use crate::model::vocab::{END_ID, START_ID};

/// Beam search configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeamConfig {
    /// Number of hypotheses to complete.
    pub k: usize,
    /// Maximum expansion steps.
    pub max_steps: usize,
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self { k: 5, max_steps: 100 }
    }
}

/// Best hypothesis found.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamResult {
    /// Token ids without the start and end sentinels.
    pub tokens: Vec<u32>,
    /// Cumulative log-probability.
    pub log_prob: f32,
    /// No hypothesis reached the end sentinel within the step budget.
    pub exhausted: bool,
}

#[derive(Debug, Clone, Copy)]
struct BeamNode {
    token: u32,
    parent: Option<usize>,
    log_prob: f32,
}

/// Search for the most likely output of a single example.
///
/// `conditioning` is `[1, d_hidden]` and `memory` holds one example.
pub fn beam_search<B: Backend>(
    decoder: &AttentionDecoder<B>,
    conditioning: Tensor<B, 2>,
    memory: &DecoderMemory<B>,
    config: &BeamConfig,
) -> Result<BeamResult> {
    let rows = conditioning.dims()[0];
    if rows != 1 {
        return Err(ModelError::shape("beam conditioning batch", 1, rows));
    }
    if memory.batch_size() != 1 {
        return Err(ModelError::shape("beam memory batch", 1, memory.batch_size()));
    }
    let device = conditioning.device();
    let vocab = decoder.vocab_size();
    let k = config.k.max(1);

    let mut arena = vec![BeamNode {
        token: START_ID,
        parent: None,
        log_prob: 0.0,
    }];
    let mut live: Vec<usize> = vec![0];
    let mut completed: Vec<usize> = Vec::new();
    let mut state = decoder.init_state(conditioning)?;

    for _ in 0..config.max_steps {
        if completed.len() >= k || live.is_empty() {
            break;
        }
        let width = live.len();
        let tokens: Vec<i32> = live.iter().map(|&n| arena[n].token as i32).collect();
        let input = Tensor::<B, 1, Int>::from_data(TensorData::new(tokens, [width]), &device);
        let out = decoder.step(input, state, &memory.repeat(width)?);
        let logits: Vec<f32> = out.logits.into_data().iter::<f32>().collect();

        // (live row, token, cumulative log-prob)
        let mut candidates: Vec<(usize, u32, f32)> = Vec::with_capacity(width * vocab);
        for (row, &node) in live.iter().enumerate() {
            let scores = log_softmax(&logits[row * vocab..(row + 1) * vocab]);
            for (t, lp) in scores.into_iter().enumerate() {
                candidates.push((row, t as u32, arena[node].log_prob + lp));
            }
        }
        // Stable: equal scores keep live-row then token order.
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(k - completed.len());

        let mut next_live = Vec::with_capacity(candidates.len());
        let mut rows = Vec::with_capacity(candidates.len());
        for (row, token, log_prob) in candidates {
            let index = arena.len();
            arena.push(BeamNode {
                token,
                parent: Some(live[row]),
                log_prob,
            });
            if token == END_ID {
                completed.push(index);
            } else {
                next_live.push(index);
                rows.push(row as i32);
            }
        }

        state = if rows.is_empty() {
            out.state
        } else {
            let n = rows.len();
            out.state
                .select(Tensor::<B, 1, Int>::from_data(TensorData::new(rows, [n]), &device))
        };
        live = next_live;
    }

    let exhausted = completed.is_empty();
    if exhausted {
        debug!(nodes = arena.len(), "beam search hit the step limit");
    }
    completed.extend(live);
    completed.sort_unstable();

    let mut best = completed[0];
    for &c in &completed[1..] {
        if arena[c].log_prob > arena[best].log_prob {
            best = c;
        }
    }

    Ok(BeamResult {
        tokens: backtrack(&arena, best),
        log_prob: arena[best].log_prob,
        exhausted,
    })
}

/// Follow parent links from `leaf` to the root, dropping sentinels.
fn backtrack(arena: &[BeamNode], leaf: usize) -> Vec<u32> {
    let mut tokens = Vec::new();
    let mut cursor = Some(leaf);
    while let Some(i) = cursor {
        let node = arena[i];
        if node.parent.is_some() && node.token != END_ID {
            tokens.push(node.token);
        }
        cursor = node.parent;
    }
    tokens.reverse();
    tokens
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum_exp = logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln() + max;
    logits.iter().map(|&l| l - log_sum_exp).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::greedy::greedy_decode;
    use crate::model::decoder::AttentionDecoderConfig;
    use burn::backend::NdArray;

    type B = NdArray;

    fn setup() -> (AttentionDecoder<B>, Tensor<B, 2>, DecoderMemory<B>) {
        let device = Default::default();
        let decoder = AttentionDecoderConfig::new(7, 4, 3, 2)
            .with_d_embed(5)
            .with_d_hidden(6)
            .with_dropout(0.0)
            .init::<B>(&device);
        let conditioning = Tensor::<B, 2>::from_data(
            TensorData::new(vec![0.4f32, -0.3, 0.2, 0.9, -0.8, 0.1], [1, 6]),
            &device,
        );
        let memory = DecoderMemory {
            slots: Tensor::ones([1, 3, 2], &device),
            active: Tensor::ones([1, 3], &device),
            suffix: Tensor::zeros([1, 4], &device),
        };
        (decoder, conditioning, memory)
    }

    #[test]
    fn width_one_equals_greedy() {
        let (decoder, conditioning, memory) = setup();
        let greedy = greedy_decode(&decoder, conditioning.clone(), &memory, 100).unwrap();
        let beam = beam_search(
            &decoder,
            conditioning,
            &memory,
            &BeamConfig { k: 1, max_steps: 100 },
        )
        .unwrap();
        assert_eq!(beam.tokens, greedy[0]);
    }

    #[test]
    fn output_never_contains_end_sentinel() {
        let (decoder, conditioning, memory) = setup();
        let config = BeamConfig { k: 3, max_steps: 12 };
        let result = beam_search(&decoder, conditioning, &memory, &config).unwrap();
        assert!(result.tokens.len() <= 12);
        assert!(!result.tokens.contains(&END_ID));
        assert!(result.log_prob <= 0.0);
    }

    #[test]
    fn searches_one_example_at_a_time() {
        let (decoder, conditioning, memory) = setup();
        let config = BeamConfig::default();
        let pair = Tensor::cat(vec![conditioning.clone(), conditioning.clone()], 0);
        assert!(matches!(
            beam_search(&decoder, pair, &memory, &config),
            Err(ModelError::ShapeMismatch { expected: 1, actual: 2, .. })
        ));

        let wide = memory.repeat(2).unwrap();
        assert!(matches!(
            beam_search(&decoder, conditioning, &wide, &config),
            Err(ModelError::ShapeMismatch { expected: 1, actual: 2, .. })
        ));
    }

    #[test]
    fn backtrack_follows_parents() {
        let arena = vec![
            BeamNode { token: START_ID, parent: None, log_prob: 0.0 },
            BeamNode { token: 5, parent: Some(0), log_prob: -0.1 },
            BeamNode { token: 6, parent: Some(0), log_prob: -0.2 },
            BeamNode { token: 4, parent: Some(1), log_prob: -0.3 },
            BeamNode { token: END_ID, parent: Some(3), log_prob: -0.4 },
        ];
        assert_eq!(backtrack(&arena, 4), vec![5, 4]);
        assert_eq!(backtrack(&arena, 2), vec![6]);
    }

    #[test]
    fn log_softmax_normalizes() {
        let lp = log_softmax(&[1.0, 2.0, 3.0]);
        let total: f32 = lp.iter().map(|v| v.exp()).sum();
        assert!((total - 1.0).abs() < 1e-6);
    }
}
