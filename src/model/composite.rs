//! Full reinflection model: encoder, quantizer stack, assembler, decoder and
//! tag heads, wrapped into one `Module` that saves and loads as a unit.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Embedding, EmbeddingConfig, Linear, LinearConfig};
use burn::prelude::*;

use super::assembler::{select_codes, AssemblerConfig, CodeAssembler, SuffixCodes};
use super::decoder::{AttentionDecoder, AttentionDecoderConfig, DecoderMemory};
use super::encoder::{EncoderConfig, EncoderOutput, SequenceEncoder};
use super::quantizer::{AssemblyMode, VqStack, VqStackConfig};
use crate::context::ComputeContext;
use crate::data::tags::{TagSet, NUM_TAG_KINDS};
use crate::error::{ModelError, Result};

/// Architecture configuration.
#[derive(Config, Debug)]
pub struct ReinflectionConfig {
    /// Character vocabulary size.
    pub vocab_size: usize,
    /// Vocabulary size of every tag attribute (id 0 included).
    pub tag_vocab_sizes: Vec<usize>,
    /// Character embedding width (encoder and decoder).
    #[config(default = 256)]
    pub d_embed: usize,
    /// Encoder hidden width per direction; also the suffix width.
    #[config(default = 660)]
    pub enc_hidden: usize,
    #[config(default = 256)]
    pub dec_hidden: usize,
    /// Root latent width.
    #[config(default = 128)]
    pub d_latent: usize,
    #[config(default = 11)]
    pub num_codebooks: usize,
    /// Entries per codebook.
    #[config(default = 6)]
    pub num_codes: usize,
    #[config(default = "AssemblyMode::SumAndConcat { groups: 11 }")]
    pub assembly: AssemblyMode,
    /// Commitment weight.
    #[config(default = 0.2)]
    pub beta: f64,
    #[config(default = true)]
    pub bidirectional: bool,
    #[config(default = 0.0)]
    pub enc_dropout: f64,
    #[config(default = 0.5)]
    pub dec_dropout: f64,
}

impl ReinflectionConfig {
    fn encoder(&self) -> EncoderConfig {
        EncoderConfig::new(self.vocab_size)
            .with_d_embed(self.d_embed)
            .with_d_hidden(self.enc_hidden)
            .with_d_latent(self.d_latent)
            .with_bidirectional(self.bidirectional)
            .with_dropout(self.enc_dropout)
    }

    fn vq(&self) -> VqStackConfig {
        VqStackConfig::new()
            .with_num_layers(self.num_codebooks)
            .with_num_codes(self.num_codes)
            .with_width(self.enc_hidden)
            .with_mode(self.assembly)
            .with_beta(self.beta)
    }

    /// Number of attention slots: one per code plus one per tag attribute.
    pub fn num_slots(&self) -> usize {
        self.num_codebooks + NUM_TAG_KINDS
    }

    /// Initialize the model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ReinflectionModel<B>> {
        if self.tag_vocab_sizes.len() != NUM_TAG_KINDS {
            return Err(ModelError::shape(
                "tag vocabularies",
                NUM_TAG_KINDS,
                self.tag_vocab_sizes.len(),
            ));
        }
        if let Some((i, &size)) = self
            .tag_vocab_sizes
            .iter()
            .enumerate()
            .take(self.num_codebooks)
            .find(|&(_, &size)| size > self.num_codes)
        {
            return Err(ModelError::Config(format!(
                "tag attribute {} has {} values but codebook {} has {} entries",
                i, size, i, self.num_codes
            )));
        }
        let vq_config = self.vq();
        let vq = vq_config.init(device)?;
        let d_code = vq_config.d_code();

        let encoder = self.encoder().init(device);
        let assembler = AssemblerConfig::new(self.d_latent, self.enc_hidden, self.dec_hidden).init(device);
        let decoder = AttentionDecoderConfig::new(self.vocab_size, self.enc_hidden, self.num_slots(), d_code)
            .with_d_embed(self.d_embed)
            .with_d_hidden(self.dec_hidden)
            .with_dropout(self.dec_dropout)
            .init(device);
        let pooled = self.encoder().pooled_width();
        let classifiers = self
            .tag_vocab_sizes
            .iter()
            .map(|&n| LinearConfig::new(pooled, n).init(device))
            .collect();
        let tag_embeddings = self
            .tag_vocab_sizes
            .iter()
            .map(|&n| EmbeddingConfig::new(n, d_code).init(device))
            .collect();

        Ok(ReinflectionModel {
            encoder,
            vq,
            assembler,
            decoder,
            classifiers,
            tag_embeddings,
        })
    }

    /// Configuration of the plain encoder whose weights can seed this model.
    pub fn pretrained_encoder(&self) -> EncoderConfig {
        self.encoder()
    }
}

/// Whether the root latent is sampled (training) or taken at its mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Sampled root latent, teacher-forced decoding.
    Train,
    /// Root latent at its mean, decoder fed its own predictions.
    Eval,
}

/// Character VQ variational encoder-decoder.
#[derive(Module, Debug)]
pub struct ReinflectionModel<B: Backend> {
    pub encoder: SequenceEncoder<B>,
    pub vq: VqStack<B>,
    pub assembler: CodeAssembler<B>,
    pub decoder: AttentionDecoder<B>,
    /// One head per tag attribute over the pooled encoder state.
    pub classifiers: Vec<Linear<B>>,
    /// One attention-slot embedding table per tag attribute.
    pub tag_embeddings: Vec<Embedding<B>>,
}

/// Everything the losses need from one forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput<B: Backend> {
    /// `[batch, len - 1, vocab]`
    pub logits: Tensor<B, 3>,
    pub mu: Tensor<B, 2>,
    pub logvar: Tensor<B, 2>,
    pub codes: SuffixCodes<B>,
    /// Per-attribute `[batch, tag_vocab]` logits.
    pub class_logits: Vec<Tensor<B, 2>>,
}

impl<B: Backend> ReinflectionModel<B> {
    /// `mu + exp(logvar / 2) * eps`, eps drawn from the context RNG.
    pub fn reparameterize(
        &self,
        ctx: &mut ComputeContext<B>,
        mu: Tensor<B, 2>,
        logvar: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let eps = ctx.standard_normal(mu.dims());
        mu + logvar.mul_scalar(0.5).exp() * eps
    }

    pub fn encode(&self, words: Tensor<B, 2, Int>) -> Result<EncoderOutput<B>> {
        self.encoder.forward(words)
    }

    /// Decoder memory for the chosen codes: code slots always active, tag
    /// slots active only where the tag is present.
    pub fn memory(&self, codes: &SuffixCodes<B>, tags: Option<&[TagSet]>) -> Result<DecoderMemory<B>> {
        let [batch, _] = codes.suffix.dims();
        let device = codes.suffix.device();
        let n = codes.codes.len();
        if let Some(tags) = tags {
            if tags.len() != batch {
                return Err(ModelError::shape("tag batch", batch, tags.len()));
            }
        }

        let mut slots = vec![Tensor::stack(codes.codes.clone(), 1)]; // [b, N, D]
        for (i, table) in self.tag_embeddings.iter().enumerate() {
            let size = table.weight.dims()[0];
            let ids: Vec<u32> = match tags {
                Some(tags) => tags.iter().map(|t| t.at(i).id()).collect(),
                None => vec![0; batch],
            };
            if let Some(&bad) = ids.iter().find(|&&id| id as usize >= size) {
                return Err(ModelError::MissingVocabEntry(format!(
                    "tag id {} for attribute {} of {} values",
                    bad, i, size
                )));
            }
            let data: Vec<i32> = ids.iter().map(|&id| id as i32).collect();
            let ids = Tensor::<B, 2, Int>::from_data(TensorData::new(data, [batch, 1]), &device);
            slots.push(table.forward(ids)); // [b, 1, D]
        }

        let width = n + NUM_TAG_KINDS;
        let mut active = Vec::with_capacity(batch * width);
        for b in 0..batch {
            active.extend(std::iter::repeat(1.0f32).take(n));
            for i in 0..NUM_TAG_KINDS {
                let present = tags.is_some_and(|t| t[b].at(i).is_present());
                active.push(if present { 1.0 } else { 0.0 });
            }
        }

        Ok(DecoderMemory {
            slots: Tensor::cat(slots, 1),
            active: Tensor::from_data(TensorData::new(active, [batch, width]), &device),
            suffix: codes.suffix.clone(),
        })
    }

    /// Autoencode `words` (`[batch, len]`). With tags, present attributes
    /// pick their codes directly; the rest are quantized.
    pub fn forward(
        &self,
        ctx: &mut ComputeContext<B>,
        words: Tensor<B, 2, Int>,
        tags: Option<&[TagSet]>,
        pass: Pass,
    ) -> Result<ForwardOutput<B>> {
        let [batch, len] = words.dims();
        let enc = self.encode(words.clone())?;
        let codes = select_codes(&self.vq, enc.vq_source(), tags)?;
        let memory = self.memory(&codes, tags)?;

        let root = match pass {
            Pass::Train => self.reparameterize(ctx, enc.mu.clone(), enc.logvar.clone()),
            Pass::Eval => enc.mu.clone(),
        };
        let conditioning = self.assembler.conditioning(root, codes.suffix.clone())?;

        let logits = match pass {
            Pass::Train => self.decoder.teacher_forced(words, conditioning, &memory)?,
            Pass::Eval => {
                let start = words.narrow(1, 0, 1).reshape([batch]);
                self.decoder
                    .free_running(start, len.saturating_sub(1), conditioning, &memory)?
            }
        };

        let class_logits = self
            .classifiers
            .iter()
            .map(|head| head.forward(enc.pooled.clone()))
            .collect();

        Ok(ForwardOutput {
            logits,
            mu: enc.mu,
            logvar: enc.logvar,
            codes,
            class_logits,
        })
    }

    /// Replace encoder embedding and recurrent weights with pretrained ones.
    pub fn with_pretrained_encoder(mut self, pretrained: SequenceEncoder<B>) -> Result<Self> {
        self.encoder = self.encoder.graft(pretrained)?;
        Ok(self)
    }
}
