//! Decoding policies and reinflection.

pub mod beam;
pub mod greedy;
pub mod reinflect;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::decoder::{AttentionDecoder, DecoderMemory};
use beam::{beam_search, BeamConfig};
use greedy::greedy_decode;

/// Step budget of greedy reinflection.
pub const GREEDY_MAX_LEN: usize = 50;

/// How a single example is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    Greedy { max_len: usize },
    Beam { k: usize, max_steps: usize },
}

impl Default for DecodePolicy {
    fn default() -> Self {
        DecodePolicy::Greedy {
            max_len: GREEDY_MAX_LEN,
        }
    }
}

impl DecodePolicy {
    /// Decode one example (`conditioning` is `[1, d_hidden]`); ids exclude
    /// the start and end sentinels.
    pub fn decode<B: Backend>(
        &self,
        decoder: &AttentionDecoder<B>,
        conditioning: Tensor<B, 2>,
        memory: &DecoderMemory<B>,
    ) -> Result<Vec<u32>> {
        match *self {
            DecodePolicy::Greedy { max_len } => Ok(greedy_decode(decoder, conditioning, memory, max_len)?
                .into_iter()
                .next()
                .unwrap_or_default()),
            DecodePolicy::Beam { k, max_steps } => {
                Ok(beam_search(decoder, conditioning, memory, &BeamConfig { k, max_steps })?.tokens)
            }
        }
    }
}
