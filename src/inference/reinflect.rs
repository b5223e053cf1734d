//! Reinflection: decode a source word's root with a different suffix.
//!
//! The root latent is the posterior mean of the source; the suffix comes
//! from an explicit code tuple or from target tags.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use burn::prelude::*;
use tracing::info;

use super::DecodePolicy;
use crate::data::corpus::LabeledLine;
use crate::data::tags::{TagSet, TagValue, TagVocabs, NUM_TAG_KINDS};
use crate::error::Result;
use crate::model::assembler::codes_from_tuples;
use crate::model::composite::ReinflectionModel;
use crate::model::vocab::Vocab;
use crate::training::ledger::tuple_key;

/// One reinflected word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reinflection {
    pub form: String,
    /// Code tuple the suffix was built from.
    pub codes: Vec<usize>,
}

/// `[1, len]` ids for a single word.
pub fn encode_word<B: Backend>(vocab: &Vocab, word: &str, device: &B::Device) -> Result<Tensor<B, 2, Int>> {
    let ids: Vec<i32> = vocab.encode(word)?.into_iter().map(|id| id as i32).collect();
    let len = ids.len();
    Ok(Tensor::from_data(TensorData::new(ids, [1, len]), device))
}

/// Code tuple the quantizers assign to `word`.
pub fn oracle_codes<B: Backend>(
    model: &ReinflectionModel<B>,
    vocab: &Vocab,
    word: &str,
    device: &B::Device,
) -> Result<Vec<usize>> {
    let enc = model.encode(encode_word(vocab, word, device)?)?;
    let out = model.vq.forward(enc.vq_source())?;
    Ok(out.code_tuples().into_iter().next().unwrap_or_default())
}

/// Decode the root of `source` with the suffix given by `codes`.
pub fn reinflect_with_codes<B: Backend>(
    model: &ReinflectionModel<B>,
    vocab: &Vocab,
    source: &str,
    codes: &[usize],
    policy: &DecodePolicy,
    device: &B::Device,
) -> Result<Reinflection> {
    decode_with(model, vocab, source, codes.to_vec(), None, policy, device)
}

/// Decode the root of `source` with codes chosen by `tags`; attributes the
/// tags leave out keep the source's own quantized code.
pub fn reinflect_with_tags<B: Backend>(
    model: &ReinflectionModel<B>,
    vocab: &Vocab,
    source: &str,
    tags: &TagSet,
    policy: &DecodePolicy,
    device: &B::Device,
) -> Result<Reinflection> {
    let mut codes = oracle_codes(model, vocab, source, device)?;
    for (i, code) in codes.iter_mut().enumerate().take(NUM_TAG_KINDS) {
        if let TagValue::Present(id) = tags.at(i) {
            *code = id as usize;
        }
    }
    decode_with(model, vocab, source, codes, Some(tags), policy, device)
}

fn decode_with<B: Backend>(
    model: &ReinflectionModel<B>,
    vocab: &Vocab,
    source: &str,
    codes: Vec<usize>,
    tags: Option<&TagSet>,
    policy: &DecodePolicy,
    device: &B::Device,
) -> Result<Reinflection> {
    let enc = model.encode(encode_word(vocab, source, device)?)?;
    let suffix = codes_from_tuples(&model.vq, std::slice::from_ref(&codes))?;
    let memory = model.memory(&suffix, tags.map(std::slice::from_ref))?;
    let conditioning = model.assembler.conditioning(enc.mu, suffix.suffix.clone())?;
    let ids = policy.decode(&model.decoder, conditioning, &memory)?;
    Ok(Reinflection {
        form: vocab.decode(&ids),
        codes,
    })
}

// ─── Shared Task ──────────────────────────────────────────────────

/// Outcome of a shared-task run.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedTaskReport {
    pub correct: usize,
    pub total: usize,
    pub true_path: PathBuf,
    pub false_path: PathBuf,
}

impl SharedTaskReport {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

/// Reinflect every test line with the gold target's oracle codes and
/// compare against the gold form.
///
/// Writes `<prefix>_TRUE.txt` and `<prefix>_FALSE.txt` into `out_dir`, one
/// `source<TAB>gold<TAB>prediction<TAB>codes` line per example.
pub fn shared_task<B: Backend>(
    model: &ReinflectionModel<B>,
    vocab: &Vocab,
    lines: &[LabeledLine],
    out_dir: &Path,
    prefix: &str,
    policy: &DecodePolicy,
    device: &B::Device,
) -> Result<SharedTaskReport> {
    std::fs::create_dir_all(out_dir)?;
    let true_path = out_dir.join(format!("{}_TRUE.txt", prefix));
    let false_path = out_dir.join(format!("{}_FALSE.txt", prefix));
    let mut hits = BufWriter::new(File::create(&true_path)?);
    let mut misses = BufWriter::new(File::create(&false_path)?);

    let mut correct = 0;
    for line in lines {
        let codes = oracle_codes(model, vocab, &line.target, device)?;
        let result = reinflect_with_codes(model, vocab, &line.source, &codes, policy, device)?;
        let record = format!(
            "{}\t{}\t{}\t{}",
            line.source,
            line.target,
            result.form,
            tuple_key(&result.codes)
        );
        if result.form == line.target {
            correct += 1;
            writeln!(hits, "{}", record)?;
        } else {
            writeln!(misses, "{}", record)?;
        }
    }
    hits.flush()?;
    misses.flush()?;

    let report = SharedTaskReport {
        correct,
        total: lines.len(),
        true_path,
        false_path,
    };
    info!(
        correct = report.correct,
        total = report.total,
        accuracy = report.accuracy(),
        "shared task"
    );
    Ok(report)
}

/// Reinflect lines using their tags instead of oracle codes. A feature
/// value missing from `tag_vocabs` fails with
/// [`ModelError::MissingVocabEntry`](crate::error::ModelError::MissingVocabEntry).
pub fn reinflect_lines<B: Backend>(
    model: &ReinflectionModel<B>,
    vocab: &Vocab,
    tag_vocabs: &TagVocabs,
    lines: &[LabeledLine],
    policy: &DecodePolicy,
    device: &B::Device,
) -> Result<Vec<Reinflection>> {
    lines
        .iter()
        .map(|line| {
            let tags = tag_vocabs.parse(&line.features)?;
            reinflect_with_tags(model, vocab, &line.source, &tags, policy, device)
        })
        .collect()
}
