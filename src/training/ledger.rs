//! Codebook usage bookkeeping.
//!
//! Diagnostics only: nothing here feeds back into training.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// File name of the code-tuple → word forms dump.
pub const SUFFIX_CODES_FILE: &str = "suffix_codes.json";
/// File name of the per-tuple usage counts.
pub const SUFFIX_USAGE_FILE: &str = "suffix_codes_usage.txt";

/// Index counts for one codebook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageLedger {
    counts: BTreeMap<usize, usize>,
}

impl UsageLedger {
    pub fn record(&mut self, index: usize) {
        *self.counts.entry(index).or_default() += 1;
    }

    /// Number of distinct indices seen.
    pub fn unique_count(&self) -> usize {
        self.counts.len()
    }

    /// Distinct indices over codebook size.
    pub fn usage_ratio(&self, capacity: usize) -> f64 {
        if capacity == 0 {
            return 0.0;
        }
        self.unique_count() as f64 / capacity as f64
    }

    pub fn count(&self, index: usize) -> usize {
        self.counts.get(&index).copied().unwrap_or(0)
    }
}

/// Render a code tuple as `i-j-k`.
pub fn tuple_key(tuple: &[usize]) -> String {
    tuple
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// Code tuples observed in one epoch, with the word forms that produced
/// them and per-codebook index counts.
#[derive(Debug, Clone, Default)]
pub struct CodeTupleLedger {
    tuples: BTreeMap<Vec<usize>, BTreeSet<String>>,
    codebooks: Vec<UsageLedger>,
}

impl CodeTupleLedger {
    pub fn new(num_codebooks: usize) -> Self {
        Self {
            tuples: BTreeMap::new(),
            codebooks: vec![UsageLedger::default(); num_codebooks],
        }
    }

    /// Record one word form and the code tuple it was assigned.
    pub fn record(&mut self, tuple: &[usize], form: &str) {
        for (ledger, &index) in self.codebooks.iter_mut().zip(tuple) {
            ledger.record(index);
        }
        self.tuples
            .entry(tuple.to_vec())
            .or_default()
            .insert(form.to_string());
    }

    /// Record a batch of `[batch][layer]` tuples with their forms.
    pub fn record_batch(&mut self, tuples: &[Vec<usize>], forms: &[String]) {
        for (tuple, form) in tuples.iter().zip(forms) {
            self.record(tuple, form);
        }
    }

    /// Number of distinct code tuples.
    pub fn unique_count(&self) -> usize {
        self.tuples.len()
    }

    pub fn contains(&self, tuple: &[usize]) -> bool {
        self.tuples.contains_key(tuple)
    }

    /// Distinct tuples over the `K^N` possible ones.
    pub fn usage_ratio(&self, num_codes: usize) -> f64 {
        let possible = (num_codes as f64).powi(self.codebooks.len() as i32);
        if possible == 0.0 {
            return 0.0;
        }
        self.unique_count() as f64 / possible
    }

    /// Distinct indices seen per codebook.
    pub fn codebook_usage(&self) -> Vec<usize> {
        self.codebooks.iter().map(UsageLedger::unique_count).collect()
    }

    pub fn codebook(&self, i: usize) -> Option<&UsageLedger> {
        self.codebooks.get(i)
    }

    /// Distinct tuples here that `training` never saw.
    pub fn novel_count(&self, training: &CodeTupleLedger) -> usize {
        self.tuples.keys().filter(|t| !training.contains(t)).count()
    }

    /// One `key: forms` line per tuple, in tuple order.
    pub fn render_usage(&self) -> String {
        let mut out = String::new();
        for (tuple, forms) in &self.tuples {
            let _ = writeln!(out, "{}: {}", tuple_key(tuple), forms.len());
        }
        out
    }

    /// JSON object mapping `i-j-k` to the sorted word forms.
    pub fn render_json(&self) -> Result<String> {
        let map: BTreeMap<String, Vec<&str>> = self
            .tuples
            .iter()
            .map(|(t, forms)| (tuple_key(t), forms.iter().map(String::as_str).collect()))
            .collect();
        Ok(serde_json::to_string_pretty(&map)?)
    }

    /// Write the tuple dump and usage file into `dir`.
    pub fn write_dump(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let codes = dir.join(SUFFIX_CODES_FILE);
        let usage = dir.join(SUFFIX_USAGE_FILE);
        std::fs::write(&codes, self.render_json()?)?;
        std::fs::write(&usage, self.render_usage())?;
        debug!(tuples = self.unique_count(), path = %codes.display(), "wrote code dump");
        Ok((codes, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> CodeTupleLedger {
        let mut l = CodeTupleLedger::new(2);
        l.record(&[0, 1], "geldi");
        l.record(&[0, 1], "aldı");
        l.record(&[3, 5], "evler");
        l.record(&[2, 1], "gelir");
        l.record(&[0, 1], "geldi");
        l
    }

    #[test]
    fn usage_ratio_counts_distinct_tuples() {
        let l = ledger();
        assert_eq!(l.unique_count(), 3);
        assert!((l.usage_ratio(6) - 3.0 / 36.0).abs() < 1e-12);
    }

    #[test]
    fn per_codebook_counts() {
        let l = ledger();
        assert_eq!(l.codebook_usage(), vec![3, 2]);
        assert_eq!(l.codebook(1).map(|c| c.count(1)), Some(4));
        assert!((l.codebook(0).unwrap().usage_ratio(6) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn novel_tuples_are_relative_to_training() {
        let training = ledger();
        let mut valid = CodeTupleLedger::new(2);
        valid.record(&[0, 1], "geldi");
        valid.record(&[4, 4], "yeni");
        assert_eq!(valid.novel_count(&training), 1);
    }

    #[test]
    fn usage_dump_format() {
        insta::assert_snapshot!(ledger().render_usage(), @r"
        0-1: 2
        2-1: 1
        3-5: 1
        ");
    }

    #[test]
    fn dump_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let (codes, usage) = ledger().write_dump(dir.path()).unwrap();
        let json: BTreeMap<String, Vec<String>> =
            serde_json::from_str(&std::fs::read_to_string(codes).unwrap()).unwrap();
        assert_eq!(json["0-1"], vec!["aldı".to_string(), "geldi".to_string()]);
        assert!(std::fs::read_to_string(usage).unwrap().starts_with("0-1: 2"));
    }
}
