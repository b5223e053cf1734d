//! Greedy decoding.

use burn::prelude::*;

use crate::error::Result;
use crate::model::decoder::{AttentionDecoder, DecoderMemory};
use crate::model::vocab::{END_ID, START_ID};
use crate::training::loss::argmax;

/// Decode every row of a batch by repeatedly taking the most likely
/// character (lowest id on ties) until the end sentinel or `max_len` steps.
///
/// Returned sequences exclude the start and end sentinels.
pub fn greedy_decode<B: Backend>(
    decoder: &AttentionDecoder<B>,
    conditioning: Tensor<B, 2>,
    memory: &DecoderMemory<B>,
    max_len: usize,
) -> Result<Vec<Vec<u32>>> {
    let batch = conditioning.dims()[0];
    let device = conditioning.device();
    let vocab = decoder.vocab_size();
    let mut state = decoder.init_state(conditioning)?;
    let mut tokens = vec![START_ID; batch];
    let mut outputs = vec![Vec::new(); batch];
    let mut finished = vec![false; batch];

    for _ in 0..max_len {
        let input = Tensor::<B, 1, Int>::from_data(
            TensorData::new(tokens.iter().map(|&t| t as i32).collect::<Vec<_>>(), [batch]),
            &device,
        );
        let out = decoder.step(input, state, memory);
        state = out.state;
        let logits: Vec<f32> = out.logits.into_data().iter::<f32>().collect();

        for row in 0..batch {
            if finished[row] {
                continue;
            }
            let next = argmax(&logits[row * vocab..(row + 1) * vocab]) as u32;
            tokens[row] = next;
            if next == END_ID {
                finished[row] = true;
            } else {
                outputs[row].push(next);
            }
        }
        if finished.iter().all(|&f| f) {
            break;
        }
    }
    Ok(outputs)
}
