//! Loss terms and token accuracy.
//!
//! Batch objective: `mean_b(recon + w * kl + vq) + classification`.

use burn::prelude::*;
use burn::tensor::activation;
use serde::{Deserialize, Serialize};

use crate::data::tags::TagSet;
use crate::error::{ModelError, Result};
use crate::model::composite::ForwardOutput;
use crate::model::vocab::PAD_ID;

/// How reconstruction loss is reduced over the positions of one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Summed over non-pad positions.
    #[default]
    Sum,
    /// Averaged over non-pad positions.
    Mean,
}

/// Per-example reconstruction cross-entropy `[batch]`.
///
/// `logits` is `[batch, len, vocab]`, `targets` is `[batch, len]`; pad
/// targets contribute nothing.
pub fn reconstruction_loss<B: Backend>(
    logits: Tensor<B, 3>,
    targets: Tensor<B, 2, Int>,
    reduction: Reduction,
) -> Tensor<B, 1> {
    let [batch, len, _] = logits.dims();
    let mask = targets.clone().not_equal_elem(PAD_ID as i32).float(); // [b, len]
    let log_probs = activation::log_softmax(logits, 2);
    let picked = log_probs
        .gather(2, targets.unsqueeze_dim::<3>(2))
        .reshape([batch, len]);
    let nll = (picked * mask.clone()).neg().sum_dim(1).reshape([batch]);
    match reduction {
        Reduction::Sum => nll,
        Reduction::Mean => nll / mask.sum_dim(1).reshape([batch]).clamp_min(1.0),
    }
}

/// KL divergence of `N(mu, exp(logvar))` from `N(0, 1)`, per example `[batch]`.
pub fn kl_divergence<B: Backend>(mu: Tensor<B, 2>, logvar: Tensor<B, 2>) -> Tensor<B, 1> {
    let batch = mu.dims()[0];
    (mu.powf_scalar(2.0) + logvar.clone().exp() - logvar)
        .sub_scalar(1.0)
        .sum_dim(1)
        .mul_scalar(0.5)
        .reshape([batch])
}

/// Tag classification loss: for each attribute, cross-entropy averaged over
/// the examples whose tag is present; attributes with no present tag are
/// skipped. Returns `None` when no attribute contributes.
pub fn classification_loss<B: Backend>(
    class_logits: &[Tensor<B, 2>],
    tags: &[TagSet],
) -> Result<Option<Tensor<B, 1>>> {
    let mut total: Option<Tensor<B, 1>> = None;
    for (i, logits) in class_logits.iter().enumerate() {
        let [batch, classes] = logits.dims();
        if tags.len() != batch {
            return Err(ModelError::shape("classifier batch", batch, tags.len()));
        }
        let ids: Vec<u32> = tags.iter().map(|t| t.at(i).id()).collect();
        let present = ids.iter().filter(|&&id| id != 0).count();
        if present == 0 {
            continue;
        }
        if let Some(&bad) = ids.iter().find(|&&id| id as usize >= classes) {
            return Err(ModelError::MissingVocabEntry(format!(
                "tag id {} for a head of {} classes",
                bad, classes
            )));
        }
        let device = logits.device();
        let mask: Vec<f32> = ids.iter().map(|&id| if id != 0 { 1.0 } else { 0.0 }).collect();
        let mask = Tensor::<B, 1>::from_data(TensorData::new(mask, [batch]), &device);
        let ids: Vec<i32> = ids.iter().map(|&id| id as i32).collect();
        let ids = Tensor::<B, 2, Int>::from_data(TensorData::new(ids, [batch, 1]), &device);

        let picked = activation::log_softmax(logits.clone(), 1)
            .gather(1, ids)
            .reshape([batch]);
        let head = (picked * mask).sum().neg().div_scalar(present as f32);
        total = Some(match total {
            Some(t) => t + head,
            None => head,
        });
    }
    Ok(total)
}

/// Correct argmax predictions and non-pad targets.
pub fn token_accuracy<B: Backend>(logits: Tensor<B, 3>, targets: Tensor<B, 2, Int>) -> (usize, usize) {
    let [batch, len, vocab] = logits.dims();
    let scores: Vec<f32> = logits.into_data().iter::<f32>().collect();
    let gold: Vec<i64> = targets.into_data().iter::<i64>().collect();
    let mut correct = 0;
    let mut total = 0;
    for pos in 0..batch * len {
        let target = gold[pos];
        if target == PAD_ID as i64 {
            continue;
        }
        total += 1;
        let row = &scores[pos * vocab..(pos + 1) * vocab];
        if argmax(row) as i64 == target {
            correct += 1;
        }
    }
    (correct, total)
}

/// Index of the largest value; ties go to the lowest index.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

// ─── Objective ────────────────────────────────────────────────────

/// Host-side sums for one or more batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LossStats {
    pub words: usize,
    /// Sum of per-example `recon + w * kl + vq`.
    pub loss: f64,
    pub recon: f64,
    pub kl: f64,
    pub vq: f64,
    /// Sum of batch classification terms.
    pub classification: f64,
    pub correct: usize,
    pub tokens: usize,
}

impl LossStats {
    pub fn merge(&mut self, other: &LossStats) {
        self.words += other.words;
        self.loss += other.loss;
        self.recon += other.recon;
        self.kl += other.kl;
        self.vq += other.vq;
        self.classification += other.classification;
        self.correct += other.correct;
        self.tokens += other.tokens;
    }

    fn per_word(&self, value: f64) -> f64 {
        if self.words == 0 {
            0.0
        } else {
            value / self.words as f64
        }
    }

    pub fn mean_loss(&self) -> f64 {
        self.per_word(self.loss)
    }

    pub fn mean_recon(&self) -> f64 {
        self.per_word(self.recon)
    }

    pub fn mean_kl(&self) -> f64 {
        self.per_word(self.kl)
    }

    pub fn mean_vq(&self) -> f64 {
        self.per_word(self.vq)
    }

    /// Correct tokens over non-pad target tokens.
    pub fn accuracy(&self) -> f64 {
        if self.tokens == 0 {
            0.0
        } else {
            self.correct as f64 / self.tokens as f64
        }
    }
}

/// Differentiable batch objective plus its host-side breakdown.
pub struct Objective<B: Backend> {
    /// Scalar `[1]` tensor to backpropagate.
    pub loss: Tensor<B, 1>,
    pub stats: LossStats,
}

/// Combine a forward pass into the batch objective.
///
/// `words` is the `[batch, len]` input that was autoencoded; tags enable
/// the classification term.
pub fn objective<B: Backend>(
    out: &ForwardOutput<B>,
    words: Tensor<B, 2, Int>,
    tags: Option<&[TagSet]>,
    kl_weight: f64,
    reduction: Reduction,
) -> Result<Objective<B>> {
    let [batch, len] = words.dims();
    let targets = words.narrow(1, 1, len - 1);

    let recon = reconstruction_loss(out.logits.clone(), targets.clone(), reduction);
    let kl = kl_divergence(out.mu.clone(), out.logvar.clone());
    let vq = out.codes.vq_loss.clone();
    let per_example = recon.clone() + kl.clone().mul_scalar(kl_weight) + vq.clone();

    let mut loss = per_example.clone().mean();
    let mut classification = 0.0;
    if let Some(tags) = tags {
        if let Some(class) = classification_loss(&out.class_logits, tags)? {
            classification = scalar(class.clone());
            loss = loss + class;
        }
    }

    let (correct, tokens) = token_accuracy(out.logits.clone(), targets);
    Ok(Objective {
        loss,
        stats: LossStats {
            words: batch,
            loss: scalar(per_example.sum()),
            recon: scalar(recon.sum()),
            kl: scalar(kl.sum()),
            vq: scalar(vq.sum()),
            classification,
            correct,
            tokens,
        },
    })
}

/// Host value of a single-element tensor.
pub fn scalar<B: Backend>(t: Tensor<B, 1>) -> f64 {
    t.into_data().iter::<f32>().next().map_or(f64::NAN, f64::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ComputeContext;
    use crate::data::tags::{TagKind, TagValue, NUM_TAG_KINDS};
    use crate::model::composite::{Pass, ReinflectionConfig};
    use crate::model::quantizer::AssemblyMode;
    use crate::model::vocab::Vocab;
    use burn::backend::NdArray;

    type B = NdArray;

    fn host<const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.into_data().iter::<f32>().collect()
    }

    #[test]
    fn kl_of_standard_normal_is_zero() {
        let device = Default::default();
        let kl = kl_divergence::<B>(Tensor::zeros([3, 4], &device), Tensor::zeros([3, 4], &device));
        assert!(host(kl).iter().all(|v| v.abs() < 1e-7));
    }

    #[test]
    fn kl_matches_closed_form() {
        let device = Default::default();
        let mu = Tensor::<B, 2>::from_data(TensorData::new(vec![1.0f32, 0.0], [1, 2]), &device);
        let logvar = Tensor::<B, 2>::from_data(TensorData::new(vec![0.0f32, 1.0], [1, 2]), &device);
        // 0.5 * ((1 + 1 - 0 - 1) + (0 + e - 1 - 1))
        let expected = 0.5 * (1.0 + std::f32::consts::E - 2.0);
        assert!((host(kl_divergence(mu, logvar))[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn padding_carries_no_loss_or_accuracy_weight() {
        let device = Default::default();
        let logits = Tensor::<B, 3>::from_data(
            TensorData::new(vec![0.0f32, 5.0, 0.0, 9.0, 0.0, 0.0], [1, 2, 3]),
            &device,
        );
        let with_pad = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![1i32, 0], [1, 2]), &device);
        let alone = Tensor::<B, 3>::from_data(TensorData::new(vec![0.0f32, 5.0, 0.0], [1, 1, 3]), &device);
        let single = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![1i32], [1, 1]), &device);

        let a = host(reconstruction_loss(logits.clone(), with_pad.clone(), Reduction::Sum))[0];
        let b = host(reconstruction_loss(alone, single, Reduction::Sum))[0];
        assert!((a - b).abs() < 1e-6);
        assert_eq!(token_accuracy(logits, with_pad), (1, 1));
    }

    #[test]
    fn mean_reduction_divides_by_real_tokens() {
        let device = Default::default();
        let logits = Tensor::<B, 3>::zeros([1, 3, 4], &device);
        let targets = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![1i32, 2, 0], [1, 3]), &device);
        let sum = host(reconstruction_loss(logits.clone(), targets.clone(), Reduction::Sum))[0];
        let mean = host(reconstruction_loss(logits, targets, Reduction::Mean))[0];
        assert!((sum - 2.0 * 4f32.ln()).abs() < 1e-5);
        assert!((mean - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn argmax_prefers_lowest_index_on_ties() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0]), 1);
        assert_eq!(argmax(&[2.0]), 0);
    }

    #[test]
    fn classification_skips_heads_without_tags() {
        let device = Default::default();
        let logits: Vec<Tensor<B, 2>> = (0..NUM_TAG_KINDS).map(|_| Tensor::zeros([2, 3], &device)).collect();
        assert!(classification_loss(&logits, &[TagSet::empty(), TagSet::empty()])
            .unwrap()
            .is_none());

        let tags = [
            TagSet::empty().with(TagKind::Case, TagValue::Present(1)),
            TagSet::empty(),
        ];
        let loss = classification_loss(&logits, &tags).unwrap().unwrap();
        // uniform over 3 classes, one present example
        assert!((host(loss)[0] - 3f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn labeled_objective_decomposes() {
        let device = Default::default();
        let vocab = Vocab::from_words(["abc"]);
        let config = ReinflectionConfig::new(vocab.size(), vec![2; NUM_TAG_KINDS])
            .with_d_embed(4)
            .with_enc_hidden(6)
            .with_dec_hidden(5)
            .with_d_latent(1)
            .with_num_codebooks(2)
            .with_num_codes(6)
            .with_assembly(AssemblyMode::Concat)
            .with_dec_dropout(0.0);
        let model = config.init::<B>(&device).unwrap();
        let mut ctx = ComputeContext::<B>::new(device, 3);

        let ids: Vec<i32> = vocab.encode("abc").unwrap().iter().map(|&i| i as i32).collect();
        let words = Tensor::<B, 2, Int>::from_data(TensorData::new(ids, [1, 5]), &device);
        let tags = [TagSet::empty().with(TagKind::Case, TagValue::Present(1))];
        let w = 0.05;

        let out = model
            .forward(&mut ctx, words.clone(), Some(&tags), Pass::Train)
            .unwrap();
        let obj = objective(&out, words.clone(), Some(&tags), w, Reduction::Sum).unwrap();

        let recon = host(reconstruction_loss(
            out.logits.clone(),
            words.clone().narrow(1, 1, 4),
            Reduction::Sum,
        ))[0];
        let kl = host(kl_divergence(out.mu.clone(), out.logvar.clone()))[0];

        let enc = model.encode(words).unwrap();
        let layer1 = model.vq.slice(enc.vq_source(), 1);
        let vq1 = host(model.vq.layers[1].forward(layer1).unwrap().loss)[0];

        let case_logits = host(out.class_logits[TagKind::Case.index()].clone());
        let lse = case_logits.iter().map(|v| v.exp()).sum::<f32>().ln();
        let ce = lse - case_logits[1];

        let expected = recon + w as f32 * kl + vq1 + ce;
        let total = host(obj.loss)[0];
        assert!((total - expected).abs() < 1e-4, "{total} vs {expected}");
        assert_eq!(obj.stats.words, 1);
        assert_eq!(obj.stats.tokens, 4);
        assert!((obj.stats.vq as f32 - vq1).abs() < 1e-5);
    }
}
