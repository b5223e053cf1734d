//! Morphological tag sets.
//!
//! Eleven independent categorical attributes. Each attribute has its own
//! vocabulary in which id 0 means "unspecified".

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Number of tag attributes.
pub const NUM_TAG_KINDS: usize = 11;

/// One morphological attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TagKind {
    Case,
    Polarity,
    Mood,
    Evidentiality,
    PartOfSpeech,
    Person,
    Number,
    Tense,
    Aspect,
    Interrogativity,
    Possession,
}

impl TagKind {
    /// All attributes in their fixed order (also the codebook order).
    pub const ALL: [TagKind; NUM_TAG_KINDS] = [
        TagKind::Case,
        TagKind::Polarity,
        TagKind::Mood,
        TagKind::Evidentiality,
        TagKind::PartOfSpeech,
        TagKind::Person,
        TagKind::Number,
        TagKind::Tense,
        TagKind::Aspect,
        TagKind::Interrogativity,
        TagKind::Possession,
    ];

    /// Key used in SIGMORPHON-style `key=value` feature lists.
    pub fn key(self) -> &'static str {
        match self {
            TagKind::Case => "case",
            TagKind::Polarity => "polar",
            TagKind::Mood => "mood",
            TagKind::Evidentiality => "evid",
            TagKind::PartOfSpeech => "pos",
            TagKind::Person => "per",
            TagKind::Number => "num",
            TagKind::Tense => "tense",
            TagKind::Aspect => "aspect",
            TagKind::Interrogativity => "inter",
            TagKind::Possession => "poss",
        }
    }

    pub fn from_key(key: &str) -> Option<TagKind> {
        TagKind::ALL.iter().copied().find(|k| k.key() == key)
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Value of one attribute for one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TagValue {
    /// Vocabulary id, always non-zero.
    Present(u32),
    #[default]
    Absent,
}

impl TagValue {
    /// Id form: 0 for absent.
    pub fn id(self) -> u32 {
        match self {
            TagValue::Present(v) => v,
            TagValue::Absent => 0,
        }
    }

    pub fn from_id(id: u32) -> Self {
        if id == 0 {
            TagValue::Absent
        } else {
            TagValue::Present(id)
        }
    }

    pub fn is_present(self) -> bool {
        matches!(self, TagValue::Present(_))
    }
}

/// All eleven attributes of one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TagSet {
    values: [TagValue; NUM_TAG_KINDS],
}

impl TagSet {
    /// Tag set with every attribute absent.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, kind: TagKind, value: TagValue) -> Self {
        self.values[kind.index()] = value;
        self
    }

    pub fn set(&mut self, kind: TagKind, value: TagValue) {
        self.values[kind.index()] = value;
    }

    pub fn get(&self, kind: TagKind) -> TagValue {
        self.values[kind.index()]
    }

    /// Value of the attribute at position `i` of [`TagKind::ALL`].
    pub fn at(&self, i: usize) -> TagValue {
        self.values[i]
    }
}

// ─── Vocabularies ─────────────────────────────────────────────────

/// Per-attribute value vocabularies. Id 0 of every attribute is reserved.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TagVocabs {
    vocabs: BTreeMap<TagKind, BTreeMap<String, u32>>,
}

impl TagVocabs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value and return its id.
    pub fn insert(&mut self, kind: TagKind, value: &str) -> u32 {
        let vocab = self.vocabs.entry(kind).or_default();
        let next = vocab.len() as u32 + 1;
        *vocab.entry(value.to_string()).or_insert(next)
    }

    pub fn id(&self, kind: TagKind, value: &str) -> Option<u32> {
        self.vocabs.get(&kind).and_then(|v| v.get(value)).copied()
    }

    /// Vocabulary size of an attribute, counting the reserved id 0.
    pub fn size(&self, kind: TagKind) -> usize {
        self.vocabs.get(&kind).map_or(0, |v| v.len()) + 1
    }

    /// Sizes of all attributes in [`TagKind::ALL`] order.
    pub fn sizes(&self) -> Vec<usize> {
        TagKind::ALL.iter().map(|&k| self.size(k)).collect()
    }

    /// Parse `key=value,key=value` into a tag set, registering new values.
    pub fn parse_and_insert(&mut self, features: &str) -> std::result::Result<TagSet, String> {
        let mut set = TagSet::empty();
        for (kind, value) in split_features(features)? {
            let id = self.insert(kind, value);
            set.set(kind, TagValue::Present(id));
        }
        Ok(set)
    }

    /// Parse `key=value,...` against the existing vocabularies.
    pub fn parse(&self, features: &str) -> Result<TagSet> {
        let mut set = TagSet::empty();
        for (kind, value) in split_features(features).map_err(ModelError::MissingVocabEntry)? {
            let id = self.id(kind, value).ok_or_else(|| {
                ModelError::MissingVocabEntry(format!("{}={}", kind.key(), value))
            })?;
            set.set(kind, TagValue::Present(id));
        }
        Ok(set)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

fn split_features(features: &str) -> std::result::Result<Vec<(TagKind, &str)>, String> {
    let mut out = Vec::new();
    for item in features.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| format!("feature {:?} is not key=value", item))?;
        // Attributes outside the eleven modelled ones (e.g. "arg") are ignored.
        if let Some(kind) = TagKind::from_key(key.trim()) {
            out.push((kind, value.trim()));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_value_zero_is_absent() {
        assert_eq!(TagValue::from_id(0), TagValue::Absent);
        assert_eq!(TagValue::from_id(3), TagValue::Present(3));
        assert_eq!(TagValue::Absent.id(), 0);
    }

    #[test]
    fn parse_assigns_ids_from_one() {
        let mut vocabs = TagVocabs::new();
        let set = vocabs
            .parse_and_insert("pos=V,polar=POS,tense=PST,per=1,num=SG")
            .unwrap();
        assert_eq!(set.get(TagKind::PartOfSpeech), TagValue::Present(1));
        assert_eq!(set.get(TagKind::Case), TagValue::Absent);

        let again = vocabs.parse_and_insert("pos=N,case=ACC").unwrap();
        assert_eq!(again.get(TagKind::PartOfSpeech), TagValue::Present(2));
        assert_eq!(vocabs.size(TagKind::PartOfSpeech), 3);
    }

    #[test]
    fn parse_rejects_unknown_value() {
        let mut vocabs = TagVocabs::new();
        vocabs.parse_and_insert("case=NOM").unwrap();
        assert!(matches!(
            vocabs.parse("case=DAT"),
            Err(ModelError::MissingVocabEntry(_))
        ));
    }
}
