//! LSTM decoder attending over code and tag embeddings.
//!
//! The decoder starts from the assembled conditioning vector and emits one
//! character per step. Each step attends over a small memory: one slot per
//! suffix code plus one slot per tag attribute.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{
    Dropout, DropoutConfig, Embedding, EmbeddingConfig, Linear, LinearConfig, Lstm, LstmConfig,
    LstmState,
};
use burn::prelude::*;
use burn::tensor::activation;

use crate::error::{ModelError, Result};

// ─── Configuration ────────────────────────────────────────────────

/// Attention decoder configuration.
#[derive(Config, Debug)]
pub struct AttentionDecoderConfig {
    /// Character vocabulary size.
    pub vocab_size: usize,
    /// Suffix width (W), concatenated to every input embedding.
    pub suffix_width: usize,
    /// Number of memory slots.
    pub num_slots: usize,
    /// Width of one memory slot.
    pub d_slot: usize,
    #[config(default = 256)]
    pub d_embed: usize,
    #[config(default = 256)]
    pub d_hidden: usize,
    /// Dropout on input embeddings.
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl AttentionDecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> AttentionDecoder<B> {
        let d_input = self.d_embed + self.suffix_width;
        AttentionDecoder {
            embed: EmbeddingConfig::new(self.vocab_size, self.d_embed).init(device),
            attn_score: LinearConfig::new(d_input + self.d_hidden, self.num_slots).init(device),
            attn_combine: LinearConfig::new(d_input + self.d_slot, d_input).init(device),
            cell: LstmConfig::new(d_input, self.d_hidden, true).init(device),
            output: LinearConfig::new(self.d_hidden, self.vocab_size).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

// ─── Decoder ──────────────────────────────────────────────────────

/// Character decoder with slot attention.
#[derive(Module, Debug)]
pub struct AttentionDecoder<B: Backend> {
    pub embed: Embedding<B>,
    attn_score: Linear<B>,
    attn_combine: Linear<B>,
    cell: Lstm<B>,
    output: Linear<B>,
    dropout: Dropout,
}

/// Recurrent state between steps.
#[derive(Debug, Clone)]
pub struct DecoderState<B: Backend> {
    /// `[batch, d_hidden]`
    pub cell: Tensor<B, 2>,
    /// `[batch, d_hidden]`
    pub hidden: Tensor<B, 2>,
}

impl<B: Backend> DecoderState<B> {
    /// Keep the rows named by `rows`, in that order.
    pub fn select(&self, rows: Tensor<B, 1, Int>) -> Self {
        Self {
            cell: self.cell.clone().select(0, rows.clone()),
            hidden: self.hidden.clone().select(0, rows),
        }
    }
}

/// What the decoder attends over and conditions on, fixed for a whole decode.
#[derive(Debug, Clone)]
pub struct DecoderMemory<B: Backend> {
    /// `[batch, S, d_slot]`
    pub slots: Tensor<B, 3>,
    /// `[batch, S]` 1.0 for active slots, 0.0 for masked ones.
    pub active: Tensor<B, 2>,
    /// `[batch, W]`
    pub suffix: Tensor<B, 2>,
}

impl<B: Backend> DecoderMemory<B> {
    pub fn batch_size(&self) -> usize {
        self.suffix.dims()[0]
    }

    /// Repeat a single-example memory `n` times.
    pub fn repeat(&self, n: usize) -> Result<Self> {
        let [batch, s, d] = self.slots.dims();
        if batch != 1 {
            return Err(ModelError::shape("repeated memory batch", 1, batch));
        }
        let w = self.suffix.dims()[1];
        Ok(Self {
            slots: self.slots.clone().expand([n, s, d]),
            active: self.active.clone().expand([n, s]),
            suffix: self.suffix.clone().expand([n, w]),
        })
    }
}

/// Output of a single decoding step.
#[derive(Debug, Clone)]
pub struct StepOutput<B: Backend> {
    /// `[batch, vocab]`
    pub logits: Tensor<B, 2>,
    pub state: DecoderState<B>,
    /// `[batch, S]` attention weights; masked slots are exactly zero.
    pub attention: Tensor<B, 2>,
}

impl<B: Backend> AttentionDecoder<B> {
    pub fn d_hidden(&self) -> usize {
        self.output.weight.dims()[0]
    }

    pub fn vocab_size(&self) -> usize {
        self.output.weight.dims()[1]
    }

    /// Initial state: cell = conditioning, hidden = tanh(conditioning).
    pub fn init_state(&self, conditioning: Tensor<B, 2>) -> Result<DecoderState<B>> {
        let d = conditioning.dims()[1];
        if d != self.d_hidden() {
            return Err(ModelError::shape("decoder conditioning", self.d_hidden(), d));
        }
        Ok(DecoderState {
            hidden: activation::tanh(conditioning.clone()),
            cell: conditioning,
        })
    }

    /// Advance one step from `tokens` (`[batch]`).
    pub fn step(
        &self,
        tokens: Tensor<B, 1, Int>,
        state: DecoderState<B>,
        memory: &DecoderMemory<B>,
    ) -> StepOutput<B> {
        let emb: Tensor<B, 2> = self
            .dropout
            .forward(self.embed.forward(tokens.unsqueeze_dim::<2>(1)))
            .squeeze_dim(1); // [b, ni]
        let x = Tensor::cat(vec![emb, memory.suffix.clone()], 1); // [b, ni + W]

        let scores = self
            .attn_score
            .forward(Tensor::cat(vec![x.clone(), state.hidden.clone()], 1)); // [b, S]
        let masked = scores.mask_fill(memory.active.clone().equal_elem(0.0), -1e9);
        let attention = activation::softmax(masked, 1) * memory.active.clone();
        let context: Tensor<B, 2> = (attention.clone().unsqueeze_dim::<3>(2) * memory.slots.clone())
            .sum_dim(1)
            .squeeze_dim(1); // [b, d_slot]

        let input = activation::relu(self.attn_combine.forward(Tensor::cat(vec![x, context], 1)));
        let (out, next) = self.cell.forward(
            input.unsqueeze_dim::<3>(1),
            Some(LstmState::new(state.cell, state.hidden)),
        );
        let logits = self.output.forward(out.squeeze_dim::<2>(1));

        StepOutput {
            logits,
            state: DecoderState {
                cell: next.cell,
                hidden: next.hidden,
            },
            attention,
        }
    }

    /// Teacher-forced logits `[batch, len - 1, vocab]` for `target` `[batch, len]`:
    /// position `t` predicts `target[t + 1]` from `target[..=t]`.
    pub fn teacher_forced(
        &self,
        target: Tensor<B, 2, Int>,
        conditioning: Tensor<B, 2>,
        memory: &DecoderMemory<B>,
    ) -> Result<Tensor<B, 3>> {
        let [batch, len] = target.dims();
        if len < 2 {
            return Err(ModelError::DegenerateBatch(
                "target shorter than start and end sentinels".into(),
            ));
        }
        let mut state = self.init_state(conditioning)?;
        let mut logits = Vec::with_capacity(len - 1);
        for t in 0..len - 1 {
            let tokens = target.clone().narrow(1, t, 1).reshape([batch]);
            let out = self.step(tokens, state, memory);
            state = out.state;
            logits.push(out.logits);
        }
        Ok(Tensor::stack(logits, 1))
    }

    /// Logits for `steps` positions where each step is fed the previous
    /// step's argmax instead of the gold token.
    pub fn free_running(
        &self,
        start: Tensor<B, 1, Int>,
        steps: usize,
        conditioning: Tensor<B, 2>,
        memory: &DecoderMemory<B>,
    ) -> Result<Tensor<B, 3>> {
        if steps == 0 {
            return Err(ModelError::DegenerateBatch("zero decoding steps".into()));
        }
        let mut state = self.init_state(conditioning)?;
        let mut tokens = start;
        let mut logits = Vec::with_capacity(steps);
        for _ in 0..steps {
            let out = self.step(tokens, state, memory);
            tokens = out.logits.clone().argmax(1).squeeze_dim(1);
            state = out.state;
            logits.push(out.logits);
        }
        Ok(Tensor::stack(logits, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    fn decoder(device: &<B as Backend>::Device) -> AttentionDecoder<B> {
        AttentionDecoderConfig::new(9, 4, 3, 2)
            .with_d_embed(5)
            .with_d_hidden(6)
            .with_dropout(0.0)
            .init(device)
    }

    fn memory(batch: usize, device: &<B as Backend>::Device) -> DecoderMemory<B> {
        let mut active = vec![1.0f32; batch * 3];
        active[2] = 0.0;
        DecoderMemory {
            slots: Tensor::ones([batch, 3, 2], device),
            active: Tensor::from_data(TensorData::new(active, [batch, 3]), device),
            suffix: Tensor::zeros([batch, 4], device),
        }
    }

    #[test]
    fn masked_slots_get_zero_weight() {
        let device = Default::default();
        let dec = decoder(&device);
        let mem = memory(2, &device);
        let state = dec.init_state(Tensor::zeros([2, 6], &device)).unwrap();
        let tokens = Tensor::<B, 1, Int>::from_data(TensorData::new(vec![1i32, 1], [2]), &device);
        let out = dec.step(tokens, state, &mem);
        assert_eq!(out.logits.dims(), [2, 9]);

        let w: Vec<f32> = out.attention.into_data().iter::<f32>().collect();
        assert_eq!(w[2], 0.0);
        assert!((w[0] + w[1] - 1.0).abs() < 1e-5);
        assert!((w[3] + w[4] + w[5] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn teacher_forced_predicts_every_position_but_first() {
        let device = Default::default();
        let dec = decoder(&device);
        let target = Tensor::<B, 2, Int>::from_data(
            TensorData::new(vec![1i32, 4, 5, 2, 1, 6, 2, 0], [2, 4]),
            &device,
        );
        let logits = dec
            .teacher_forced(target, Tensor::zeros([2, 6], &device), &memory(2, &device))
            .unwrap();
        assert_eq!(logits.dims(), [2, 3, 9]);
    }

    #[test]
    fn conditioning_width_must_match_hidden() {
        let device = Default::default();
        let dec = decoder(&device);
        assert!(matches!(
            dec.init_state(Tensor::zeros([1, 5], &device)),
            Err(ModelError::ShapeMismatch { expected: 6, actual: 5, .. })
        ));
    }

    #[test]
    fn repeated_memory_broadcasts_first_row() {
        let device = Default::default();
        let mem = memory(1, &device).repeat(4).unwrap();
        assert_eq!(mem.slots.dims(), [4, 3, 2]);
        assert_eq!(mem.batch_size(), 4);
        assert!(matches!(
            memory(2, &device).repeat(4),
            Err(ModelError::ShapeMismatch { expected: 1, actual: 2, .. })
        ));
    }
}
