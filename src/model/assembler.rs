//! Combines the continuous root latent with the discrete suffix codes.
//!
//! Codes are either quantized from the encoder state or, when a gold tag is
//! known, read straight out of the codebook at the tag's id.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation;

use super::quantizer::VqStack;
use crate::data::tags::{TagSet, NUM_TAG_KINDS};
use crate::error::{ModelError, Result};

/// Assembler configuration.
#[derive(Config, Debug)]
pub struct AssemblerConfig {
    /// Root latent width.
    pub d_latent: usize,
    /// Suffix width.
    pub suffix_width: usize,
    /// Decoder hidden width.
    pub d_output: usize,
}

impl AssemblerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CodeAssembler<B> {
        CodeAssembler {
            root_proj: LinearConfig::new(self.d_latent, self.d_output).init(device),
            suffix_proj: LinearConfig::new(self.suffix_width, self.d_output).init(device),
        }
    }
}

/// `tanh(f(root) + g(suffix))`.
#[derive(Module, Debug)]
pub struct CodeAssembler<B: Backend> {
    pub root_proj: Linear<B>,
    pub suffix_proj: Linear<B>,
}

/// Codes chosen for one batch.
#[derive(Debug, Clone)]
pub struct SuffixCodes<B: Backend> {
    /// `[batch, W]` assembled suffix.
    pub suffix: Tensor<B, 2>,
    /// Per-layer `[batch, D]` codes, used as attention memory.
    pub codes: Vec<Tensor<B, 2>>,
    /// Chosen index per layer per example, `[layer][batch]`.
    pub indices: Vec<Vec<usize>>,
    /// `[batch]` quantization loss summed over layers, zero where supervised.
    pub vq_loss: Tensor<B, 1>,
}

impl<B: Backend> SuffixCodes<B> {
    /// Code tuple of every example, `[batch][layer]`.
    pub fn code_tuples(&self) -> Vec<Vec<usize>> {
        let batch = self.indices.first().map_or(0, Vec::len);
        (0..batch)
            .map(|b| self.indices.iter().map(|layer| layer[b]).collect())
            .collect()
    }
}

impl<B: Backend> CodeAssembler<B> {
    /// Decoder conditioning vector from a root latent and a suffix.
    pub fn conditioning(&self, root: Tensor<B, 2>, suffix: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        let expected = self.suffix_proj.weight.dims()[0];
        let actual = suffix.dims()[1];
        if expected != actual {
            return Err(ModelError::shape("assembler suffix", expected, actual));
        }
        let expected = self.root_proj.weight.dims()[0];
        let actual = root.dims()[1];
        if expected != actual {
            return Err(ModelError::shape("assembler root", expected, actual));
        }
        Ok(activation::tanh(
            self.root_proj.forward(root) + self.suffix_proj.forward(suffix),
        ))
    }
}

/// Choose codes for a batch.
///
/// Without tags every layer quantizes its slice of `source`. With tags,
/// layer `i` takes `codebook_i[tag_i]` for each example whose `i`-th
/// attribute is present and contributes no quantization loss there; other
/// examples fall back to quantization.
pub fn select_codes<B: Backend>(
    vq: &VqStack<B>,
    source: Tensor<B, 2>,
    tags: Option<&[TagSet]>,
) -> Result<SuffixCodes<B>> {
    let batch = source.dims()[0];
    let device = source.device();
    let quantized = vq.forward(source)?;
    if let Some(tags) = tags {
        if tags.len() != batch {
            return Err(ModelError::shape("tag batch", batch, tags.len()));
        }
    }

    let mut codes = Vec::with_capacity(vq.num_layers());
    let mut indices = Vec::with_capacity(vq.num_layers());
    let mut vq_loss = Tensor::<B, 1>::zeros([batch], &device);

    for (i, (layer, out)) in vq.layers.iter().zip(quantized.layers).enumerate() {
        let supervised = match tags {
            Some(tags) if i < NUM_TAG_KINDS => tags.iter().map(|t| t.at(i).id()).collect::<Vec<_>>(),
            _ => vec![0; batch],
        };
        if supervised.iter().all(|&id| id == 0) {
            codes.push(out.quantized);
            indices.push(out.indices);
            vq_loss = vq_loss + out.loss;
            continue;
        }

        let ids: Vec<usize> = supervised.iter().map(|&id| id as usize).collect();
        let gold = layer.lookup(&ids)?;
        let mask_data: Vec<f32> = supervised
            .iter()
            .map(|&id| if id != 0 { 1.0 } else { 0.0 })
            .collect();
        let mask = Tensor::<B, 1>::from_data(TensorData::new(mask_data, [batch]), &device);
        let keep = mask.clone().neg().add_scalar(1.0);

        let mask_col = mask.unsqueeze_dim::<2>(1);
        let keep_col = keep.clone().unsqueeze_dim::<2>(1);
        codes.push(gold * mask_col + out.quantized * keep_col);
        indices.push(
            supervised
                .iter()
                .zip(&out.indices)
                .map(|(&tag, &idx)| if tag != 0 { tag as usize } else { idx })
                .collect(),
        );
        vq_loss = vq_loss + out.loss * keep;
    }

    let suffix = vq.assemble(codes.clone())?;
    Ok(SuffixCodes {
        suffix,
        codes,
        indices,
        vq_loss,
    })
}

/// Codes for explicit code tuples, one per example. No loss.
pub fn codes_from_tuples<B: Backend>(vq: &VqStack<B>, tuples: &[Vec<usize>]) -> Result<SuffixCodes<B>> {
    let (codes, indices) = vq.lookup_layers(tuples)?;
    let suffix = vq.assemble(codes.clone())?;
    let device = suffix.device();
    Ok(SuffixCodes {
        suffix,
        codes,
        indices,
        vq_loss: Tensor::zeros([tuples.len()], &device),
    })
}
