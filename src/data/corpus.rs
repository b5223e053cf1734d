//! Reader for SIGMORPHON-style reinflection files.
//!
//! Labeled lines are `source<TAB>key=value,...<TAB>target`; unlabeled files
//! hold one word per line (extra tab-separated columns are ignored).

use std::path::Path;

use tracing::info;

use super::batch::{make_batches, Batch, BatchSource, Example, Partition};
use super::tags::{TagSet, TagVocabs};
use crate::error::{ModelError, Result};
use crate::model::vocab::Vocab;

/// One raw labeled line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledLine {
    pub source: String,
    pub features: String,
    pub target: String,
}

/// Parse labeled lines from text. Blank lines are skipped.
pub fn parse_labeled(text: &str, origin: &str) -> Result<Vec<LabeledLine>> {
    let mut out = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() != 3 {
            return Err(ModelError::Corpus {
                path: origin.to_string(),
                line: i + 1,
                message: format!("expected 3 tab-separated columns, found {}", cols.len()),
            });
        }
        out.push(LabeledLine {
            source: cols[0].to_string(),
            features: cols[1].to_string(),
            target: cols[2].to_string(),
        });
    }
    Ok(out)
}

/// Parse an unlabeled word list (first column of each line).
pub fn parse_unlabeled(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|l| l.split('\t').next())
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Paths of the data splits.
#[derive(Debug, Clone)]
pub struct CorpusPaths<'a> {
    pub train: &'a Path,
    pub unlabeled: Option<&'a Path>,
    pub valid: &'a Path,
    pub test: &'a Path,
}

/// All partitions, encoded and batched, plus the vocabularies built from them.
pub struct Corpus {
    pub surf_vocab: Vocab,
    pub tag_vocabs: TagVocabs,
    labeled_source: Vec<Batch>,
    labeled_target: Vec<Batch>,
    unlabeled: Vec<Batch>,
    validation: Vec<Batch>,
    test: Vec<Batch>,
    /// Raw test lines for the shared-task evaluation.
    pub test_lines: Vec<LabeledLine>,
}

impl Corpus {
    /// Read every split from disk.
    pub fn load(paths: &CorpusPaths<'_>, batch_size: usize, max_valid: usize) -> Result<Self> {
        let read = |p: &Path| -> Result<String> { Ok(std::fs::read_to_string(p)?) };
        let train = parse_labeled(&read(paths.train)?, &paths.train.display().to_string())?;
        let mut valid = parse_labeled(&read(paths.valid)?, &paths.valid.display().to_string())?;
        valid.truncate(max_valid);
        let test = parse_labeled(&read(paths.test)?, &paths.test.display().to_string())?;
        let unlabeled = match paths.unlabeled {
            Some(p) => parse_unlabeled(&read(p)?),
            None => Vec::new(),
        };
        Self::from_lines(train, unlabeled, valid, test, batch_size)
    }

    /// Build from already-parsed lines.
    ///
    /// The character vocabulary covers training and unlabeled words; the
    /// tag vocabularies are built from training features only.
    pub fn from_lines(
        train: Vec<LabeledLine>,
        unlabeled: Vec<String>,
        valid: Vec<LabeledLine>,
        test: Vec<LabeledLine>,
        batch_size: usize,
    ) -> Result<Self> {
        let surf_vocab = Vocab::from_words(
            train
                .iter()
                .flat_map(|l| [l.source.as_str(), l.target.as_str()])
                .chain(unlabeled.iter().map(String::as_str))
                .chain(
                    valid
                        .iter()
                        .chain(test.iter())
                        .flat_map(|l| [l.source.as_str(), l.target.as_str()]),
                ),
        );

        let mut tag_vocabs = TagVocabs::new();
        let mut train_tags = Vec::with_capacity(train.len());
        for (i, line) in train.iter().enumerate() {
            let tags = tag_vocabs
                .parse_and_insert(&line.features)
                .map_err(|message| ModelError::Corpus {
                    path: "train".into(),
                    line: i + 1,
                    message,
                })?;
            train_tags.push(tags);
        }

        let mut src_examples = Vec::with_capacity(train.len());
        let mut tgt_examples = Vec::with_capacity(train.len());
        for (line, tags) in train.iter().zip(train_tags) {
            let source = surf_vocab.encode(&line.source)?;
            let target = surf_vocab.encode(&line.target)?;
            src_examples.push(Example {
                source: source.clone(),
                tags,
                target: target.clone(),
            });
            tgt_examples.push(Example {
                source: target.clone(),
                tags,
                target,
            });
        }

        let mut unlabeled_examples = Vec::with_capacity(unlabeled.len());
        for word in &unlabeled {
            let ids = surf_vocab.encode(word)?;
            unlabeled_examples.push(Example {
                source: ids.clone(),
                tags: TagSet::empty(),
                target: ids,
            });
        }

        // Validation and test words are autoencoded without tags, so their
        // features are not looked up at all.
        let encode_eval = |lines: &[LabeledLine]| -> Result<Vec<Example>> {
            lines
                .iter()
                .map(|l| {
                    Ok(Example {
                        source: surf_vocab.encode(&l.source)?,
                        tags: TagSet::empty(),
                        target: surf_vocab.encode(&l.target)?,
                    })
                })
                .collect()
        };
        let valid_examples = encode_eval(&valid)?;
        let test_examples = encode_eval(&test)?;

        info!(
            train = train.len(),
            unlabeled = unlabeled.len(),
            valid = valid.len(),
            test = test.len(),
            chars = surf_vocab.size(),
            "corpus loaded"
        );

        Ok(Corpus {
            surf_vocab,
            tag_vocabs,
            labeled_source: make_batches(src_examples, batch_size),
            labeled_target: make_batches(tgt_examples, batch_size),
            unlabeled: make_batches(unlabeled_examples, batch_size),
            validation: make_batches(valid_examples, batch_size),
            test: make_batches(test_examples, batch_size),
            test_lines: test,
        })
    }
}

impl BatchSource for Corpus {
    fn batches(&self, partition: Partition) -> &[Batch] {
        match partition {
            Partition::LabeledSource => &self.labeled_source,
            Partition::LabeledTarget => &self.labeled_target,
            Partition::Unlabeled => &self.unlabeled,
            Partition::Validation => &self.validation,
            Partition::Test => &self.test,
        }
    }
}
