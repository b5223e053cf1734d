//! Bidirectional LSTM sequence encoder with a Gaussian posterior head.
//!
//! Encodes padded character ids into per-step states, a pooled final state
//! and the posterior parameters (mean, log-variance) of the root latent.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{
    Dropout, DropoutConfig, Embedding, EmbeddingConfig, Linear, LinearConfig, Lstm, LstmConfig,
};
use burn::prelude::*;

use crate::error::{ModelError, Result};
use crate::model::vocab::PAD_ID;

// ─── Configuration ────────────────────────────────────────────────

/// Sequence encoder configuration.
#[derive(Config, Debug)]
pub struct EncoderConfig {
    /// Character vocabulary size.
    pub vocab_size: usize,
    /// Character embedding size.
    #[config(default = 256)]
    pub d_embed: usize,
    /// LSTM hidden size per direction.
    #[config(default = 660)]
    pub d_hidden: usize,
    /// Root latent size.
    #[config(default = 128)]
    pub d_latent: usize,
    /// Run a second LSTM over the reversed sequence.
    #[config(default = true)]
    pub bidirectional: bool,
    /// Dropout on character embeddings.
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl EncoderConfig {
    /// Width of the pooled final state.
    pub fn pooled_width(&self) -> usize {
        if self.bidirectional {
            2 * self.d_hidden
        } else {
            self.d_hidden
        }
    }

    /// Initialize the encoder.
    pub fn init<B: Backend>(&self, device: &B::Device) -> SequenceEncoder<B> {
        SequenceEncoder {
            embed: EmbeddingConfig::new(self.vocab_size, self.d_embed).init(device),
            forward_cell: LstmConfig::new(self.d_embed, self.d_hidden, true).init(device),
            backward_cell: self
                .bidirectional
                .then(|| LstmConfig::new(self.d_embed, self.d_hidden, true).init(device)),
            latent_proj: LinearConfig::new(self.pooled_width(), 2 * self.d_latent).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            d_latent: self.d_latent,
        }
    }
}

// ─── Encoder ──────────────────────────────────────────────────────

/// Sequence encoder.
#[derive(Module, Debug)]
pub struct SequenceEncoder<B: Backend> {
    /// Character embedding.
    pub embed: Embedding<B>,
    /// Left-to-right LSTM.
    pub forward_cell: Lstm<B>,
    /// Right-to-left LSTM (bidirectional only).
    pub backward_cell: Option<Lstm<B>>,
    /// Pooled state → [mean; logvar].
    pub latent_proj: Linear<B>,
    dropout: Dropout,
    d_latent: usize,
}

/// Everything the encoder produces for one batch.
#[derive(Debug, Clone)]
pub struct EncoderOutput<B: Backend> {
    /// `[batch, nz]`
    pub mu: Tensor<B, 2>,
    /// `[batch, nz]`
    pub logvar: Tensor<B, 2>,
    /// `[batch, len, H]` per-step states (both directions concatenated).
    pub states: Tensor<B, 3>,
    /// `[batch, H]` final states (both directions concatenated).
    pub pooled: Tensor<B, 2>,
    /// `[batch, d_hidden]` forward final state.
    pub forward_final: Tensor<B, 2>,
    /// `[batch, d_hidden]` backward final state.
    pub backward_final: Option<Tensor<B, 2>>,
}

impl<B: Backend> EncoderOutput<B> {
    /// Vector handed to the quantizers: the backward final state when
    /// available, otherwise the forward one.
    pub fn vq_source(&self) -> Tensor<B, 2> {
        self.backward_final
            .clone()
            .unwrap_or_else(|| self.forward_final.clone())
    }
}

impl<B: Backend> SequenceEncoder<B> {
    pub fn d_latent(&self) -> usize {
        self.d_latent
    }

    /// Hidden size of one direction.
    pub fn d_hidden(&self) -> usize {
        self.latent_proj.weight.dims()[0] / if self.backward_cell.is_some() { 2 } else { 1 }
    }

    /// Encode `[batch, len]` ids.
    ///
    /// Each row's final state is read at its last non-pad position, and the
    /// backward pass starts at that position, so padding never leaks in.
    pub fn forward(&self, input: Tensor<B, 2, Int>) -> Result<EncoderOutput<B>> {
        let [batch, len] = input.dims();
        let device = input.device();
        let lengths = sequence_lengths(&input)?;

        let emb = self.dropout.forward(self.embed.forward(input)); // [b, len, ni]
        let d_embed = emb.dims()[2];

        let (fwd_states, _) = self.forward_cell.forward(emb.clone(), None);
        let d_hidden = fwd_states.dims()[2];
        let last = last_index::<B>(&lengths, d_hidden, &device);
        let forward_final: Tensor<B, 2> = fwd_states.clone().gather(1, last.clone()).squeeze_dim(1);

        let (states, backward_final) = match &self.backward_cell {
            Some(cell) => {
                let perm = reverse_prefix_index::<B>(&lengths, len, &device);
                let reversed = emb.gather(1, expand_index(perm.clone(), d_embed));
                let (bck_rev, _) = cell.forward(reversed, None);
                let bck_final: Tensor<B, 2> = bck_rev.clone().gather(1, last).squeeze_dim(1);
                // The prefix reversal is its own inverse.
                let bck_states = bck_rev.gather(1, expand_index(perm, d_hidden));
                (
                    Tensor::cat(vec![fwd_states, bck_states], 2),
                    Some(bck_final),
                )
            }
            None => (fwd_states, None),
        };

        let pooled = match &backward_final {
            Some(b) => Tensor::cat(vec![forward_final.clone(), b.clone()], 1),
            None => forward_final.clone(),
        };
        let proj = self.latent_proj.forward(pooled.clone()); // [b, 2nz]
        let mu = proj.clone().narrow(1, 0, self.d_latent);
        let logvar = proj.narrow(1, self.d_latent, self.d_latent);
        debug_assert_eq!(mu.dims(), [batch, self.d_latent]);

        Ok(EncoderOutput {
            mu,
            logvar,
            states,
            pooled,
            forward_final,
            backward_final,
        })
    }

    /// Take embedding and recurrent weights from a pretrained encoder while
    /// keeping this encoder's latent projection.
    pub fn graft(mut self, pretrained: SequenceEncoder<B>) -> Result<Self> {
        let [v_own, e_own] = self.embed.weight.dims();
        let [v_pre, e_pre] = pretrained.embed.weight.dims();
        if v_own != v_pre {
            return Err(ModelError::shape("pretrained vocabulary", v_own, v_pre));
        }
        if e_own != e_pre {
            return Err(ModelError::shape("pretrained embedding width", e_own, e_pre));
        }
        if self.backward_cell.is_some() != pretrained.backward_cell.is_some() {
            return Err(ModelError::Config(
                "pretrained encoder directionality differs".into(),
            ));
        }
        if self.d_hidden() != pretrained.d_hidden() {
            return Err(ModelError::shape(
                "pretrained hidden size",
                self.d_hidden(),
                pretrained.d_hidden(),
            ));
        }
        self.embed = pretrained.embed;
        self.forward_cell = pretrained.forward_cell;
        self.backward_cell = pretrained.backward_cell;
        Ok(self)
    }
}

/// Non-pad length of every row. Rows made only of padding are rejected.
fn sequence_lengths<B: Backend>(input: &Tensor<B, 2, Int>) -> Result<Vec<usize>> {
    let [batch, len] = input.dims();
    let ids: Vec<i64> = input.to_data().iter::<i64>().collect();
    let mut lengths = Vec::with_capacity(batch);
    for row in 0..batch {
        let seq = &ids[row * len..(row + 1) * len];
        let n = seq
            .iter()
            .rposition(|&id| id != PAD_ID as i64)
            .map_or(0, |p| p + 1);
        if n == 0 {
            return Err(ModelError::DegenerateBatch(format!(
                "row {} of {} is all padding",
                row, batch
            )));
        }
        lengths.push(n);
    }
    Ok(lengths)
}

/// `[batch, 1, width]` index of each row's last real position.
fn last_index<B: Backend>(lengths: &[usize], width: usize, device: &B::Device) -> Tensor<B, 3, Int> {
    let data: Vec<i32> = lengths.iter().map(|&n| (n - 1) as i32).collect();
    let idx = Tensor::<B, 2, Int>::from_data(TensorData::new(data, [lengths.len(), 1]), device);
    idx.unsqueeze_dim::<3>(2).expand([lengths.len(), 1, width])
}

/// `[batch, len]` permutation reversing each row's non-pad prefix.
fn reverse_prefix_index<B: Backend>(
    lengths: &[usize],
    len: usize,
    device: &B::Device,
) -> Tensor<B, 2, Int> {
    let mut data = Vec::with_capacity(lengths.len() * len);
    for &n in lengths {
        data.extend((0..n).rev().map(|p| p as i32));
        data.extend((n..len).map(|p| p as i32));
    }
    Tensor::from_data(TensorData::new(data, [lengths.len(), len]), device)
}

/// Broadcast a `[batch, len]` index over a feature axis of `width`.
fn expand_index<B: Backend>(perm: Tensor<B, 2, Int>, width: usize) -> Tensor<B, 3, Int> {
    let [batch, len] = perm.dims();
    perm.unsqueeze_dim::<3>(2).expand([batch, len, width])
}

// ─── Tests ────────────────────────────────────────────────────────
