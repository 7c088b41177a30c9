//! Candidate blocking: cheap keys that bucket likely co-referent mentions so
//! similarity scoring never scans the whole graph.
//!
//! Each mention value yields two keys, both scoped by entity type: a prefix
//! of the normalized value and a phonetic code of its first token. An entity
//! is indexed under the keys of every surface form observed for it.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;

use crate::model::EntityId;

/// Blocking key. Ordered so lock acquisition over multiple keys can be
/// deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub entity_type: String,
    pub code: String,
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.code)
    }
}

/// Lowercases, strips punctuation, and collapses whitespace.
pub struct Normalizer {
    strip: Regex,
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            strip: Regex::new(r"[^\w\s]").expect("Invalid regex pattern"),
        }
    }

    pub fn normalize(&self, raw: &str) -> String {
        let lowered = raw.to_lowercase();
        let stripped = self.strip.replace_all(&lowered, "");
        stripped.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn consonant_code(c: char) -> Option<char> {
    match c {
        'b' | 'f' | 'p' | 'v' => Some('1'),
        'c' | 'g' | 'j' | 'k' | 'q' | 's' | 'x' | 'z' => Some('2'),
        'd' | 't' => Some('3'),
        'l' => Some('4'),
        'm' | 'n' => Some('5'),
        'r' => Some('6'),
        _ => None,
    }
}

/// Soundex-style code of a token: first letter plus up to three consonant
/// class digits, zero-padded. Tolerates misspellings that preserve the
/// consonant skeleton ("aple" and "apple" share a code).
pub fn phonetic_code(token: &str) -> String {
    let mut letters = token.chars().filter(|c| c.is_ascii_alphabetic());
    let Some(first) = letters.next() else {
        return String::new();
    };
    let first = first.to_ascii_lowercase();
    let mut out = String::with_capacity(4);
    out.push(first);
    let mut prev = consonant_code(first);
    for c in letters {
        let c = c.to_ascii_lowercase();
        match consonant_code(c) {
            Some(digit) => {
                if prev != Some(digit) {
                    out.push(digit);
                    if out.len() == 4 {
                        break;
                    }
                }
                prev = Some(digit);
            }
            None => {
                // vowels separate duplicate codes; h and w do not
                if c != 'h' && c != 'w' {
                    prev = None;
                }
            }
        }
    }
    while out.len() < 4 {
        out.push('0');
    }
    out
}

/// Keys a normalized value falls into: value prefix and first-token phonetic
/// code, each scoped by entity type.
pub fn keys_for(entity_type: &str, normalized: &str, prefix_len: usize) -> Vec<BlockKey> {
    let prefix: String = normalized
        .chars()
        .filter(|c| !c.is_whitespace())
        .take(prefix_len)
        .collect();
    let mut keys = vec![BlockKey {
        entity_type: entity_type.to_string(),
        code: format!("p:{}", prefix),
    }];
    if let Some(token) = normalized.split_whitespace().next() {
        let phonetic = phonetic_code(token);
        if !phonetic.is_empty() {
            let key = BlockKey {
                entity_type: entity_type.to_string(),
                code: format!("s:{}", phonetic),
            };
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
}

/// Inverted index from block keys to entity postings.
#[derive(Default)]
pub struct BlockIndex {
    blocks: HashMap<BlockKey, Vec<EntityId>>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, keys: &[BlockKey], id: EntityId) {
        for key in keys {
            let posting = self.blocks.entry(key.clone()).or_default();
            if !posting.contains(&id) {
                posting.push(id);
            }
        }
    }

    /// Union of postings across keys, deduplicated and sorted.
    pub fn candidates(&self, keys: &[BlockKey]) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = keys
            .iter()
            .flat_map(|key| self.blocks.get(key).into_iter().flatten())
            .copied()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn posting_count(&self) -> usize {
        self.blocks.values().map(|p| p.len()).sum()
    }

    /// Size of the largest block, for skew diagnostics.
    pub fn max_block_size(&self) -> usize {
        self.blocks.values().map(|p| p.len()).max().unwrap_or(0)
    }
}
