//! Character vocabulary with fixed sentinel ids.
//!
//! Id 0 is padding, 1 the start sentinel, 2 the end sentinel. Every other
//! character seen while building the vocabulary gets the next free id.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

pub const PAD: &str = "<pad>";
pub const START: &str = "<s>";
pub const END: &str = "</s>";

pub const PAD_ID: u32 = 0;
pub const START_ID: u32 = 1;
pub const END_ID: u32 = 2;

// ─── Vocab Struct ─────────────────────────────────────────────────

/// Bidirectional character ↔ id mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "HashMap<String, u32>", into = "HashMap<String, u32>")]
pub struct Vocab {
    encode_map: HashMap<String, u32>,
    decode_map: Vec<String>,
}

impl Vocab {
    /// Vocabulary holding only the three sentinels.
    pub fn new() -> Self {
        let mut vocab = Vocab {
            encode_map: HashMap::new(),
            decode_map: Vec::new(),
        };
        for token in [PAD, START, END] {
            vocab.insert(token);
        }
        vocab
    }

    /// Build a vocabulary from every character of `words`, in first-seen order.
    pub fn from_words<'a>(words: impl IntoIterator<Item = &'a str>) -> Self {
        let mut vocab = Self::new();
        for word in words {
            for ch in word.chars() {
                vocab.insert(&ch.to_string());
            }
        }
        vocab
    }

    fn insert(&mut self, token: &str) -> u32 {
        if let Some(&id) = self.encode_map.get(token) {
            return id;
        }
        let id = self.decode_map.len() as u32;
        self.encode_map.insert(token.to_string(), id);
        self.decode_map.push(token.to_string());
        id
    }

    /// Id of a single token.
    pub fn id(&self, token: &str) -> Option<u32> {
        self.encode_map.get(token).copied()
    }

    /// Token for an id.
    pub fn token(&self, id: u32) -> Option<&str> {
        self.decode_map.get(id as usize).map(|s| s.as_str())
    }

    /// Vocabulary size including sentinels.
    pub fn size(&self) -> usize {
        self.decode_map.len()
    }

    /// Encode a word as `<s> c1 .. cn </s>`.
    ///
    /// Characters outside the vocabulary are an error; nothing is substituted.
    pub fn encode(&self, word: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(word.chars().count() + 2);
        ids.push(START_ID);
        for ch in word.chars() {
            let id = self.id(&ch.to_string()).ok_or_else(|| {
                ModelError::MissingVocabEntry(format!("character {:?} in {:?}", ch, word))
            })?;
            ids.push(id);
        }
        ids.push(END_ID);
        Ok(ids)
    }

    /// Decode ids back to a word, dropping sentinels and padding and
    /// stopping at the first end sentinel.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut word = String::new();
        for &id in ids {
            match id {
                END_ID => break,
                PAD_ID | START_ID => continue,
                _ => {
                    if let Some(tok) = self.token(id) {
                        word.push_str(tok);
                    }
                }
            }
        }
        word
    }

    /// Save as a JSON `token -> id` object.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a vocabulary written by [`Vocab::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let vocab: Vocab = serde_json::from_str(&text)?;
        if vocab.id(PAD) != Some(PAD_ID)
            || vocab.id(START) != Some(START_ID)
            || vocab.id(END) != Some(END_ID)
        {
            return Err(ModelError::Config(format!(
                "{}: sentinel ids must be {}=0, {}=1, {}=2",
                path.display(),
                PAD,
                START,
                END
            )));
        }
        Ok(vocab)
    }
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new()
    }
}

impl From<HashMap<String, u32>> for Vocab {
    fn from(map: HashMap<String, u32>) -> Self {
        let mut pairs: Vec<(String, u32)> = map.into_iter().collect();
        pairs.sort_by_key(|(_, id)| *id);
        let decode_map: Vec<String> = pairs.iter().map(|(t, _)| t.clone()).collect();
        let encode_map = pairs.into_iter().collect();
        Vocab {
            encode_map,
            decode_map,
        }
    }
}

impl From<Vocab> for HashMap<String, u32> {
    fn from(vocab: Vocab) -> Self {
        vocab.encode_map
    }
}

// ─── Tests ────────────────────────────────────────────────────────
