//! Mention data model: the evidence units consumed by the consolidation engine.
//!
//! Mentions are immutable once emitted by upstream extraction. Attribute
//! payloads use a closed tagged union (`AttrValue`) so conflict comparison
//! stays well-defined, and every mention carries a SHA-256 fingerprint used
//! to make resubmission idempotent.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{GraphweldError, Result};

/// Stable identifier of a canonical entity.
pub type EntityId = Uuid;
/// Stable identifier of a canonical relationship.
pub type RelationshipId = Uuid;
/// Identifier of a single mention.
pub type MentionId = Uuid;

/// Identifies the canonical object an assertion, conflict, or trace refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SubjectId {
    Entity(EntityId),
    Relationship(RelationshipId),
}

impl SubjectId {
    pub fn uuid(&self) -> Uuid {
        match self {
            SubjectId::Entity(id) => *id,
            SubjectId::Relationship(id) => *id,
        }
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectId::Entity(id) => write!(f, "entity:{}", id),
            SubjectId::Relationship(id) => write!(f, "relationship:{}", id),
        }
    }
}

/// Attribute value: closed set of kinds rather than open-ended dynamic typing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    Text(String),
    Number(f64),
    Timestamp(DateTime<Utc>),
    Reference(Uuid),
}

impl AttrValue {
    /// Canonical comparison key. Two assertions compete or corroborate based
    /// on this key, which avoids needing `Eq`/`Hash` on `f64`.
    pub fn canonical_key(&self) -> String {
        match self {
            AttrValue::Text(s) => format!("s:{}", s.trim()),
            AttrValue::Number(n) => format!("n:{}", n),
            AttrValue::Timestamp(t) => format!("d:{}", t.to_rfc3339()),
            AttrValue::Reference(id) => format!("r:{}", id),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Text(s) => write!(f, "{}", s),
            AttrValue::Number(n) => write!(f, "{}", n),
            AttrValue::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            AttrValue::Reference(id) => write!(f, "{}", id),
        }
    }
}

/// Character span of the mention in its source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

/// Normalized reference to an entity, used for relationship endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub value: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            value: value.into(),
        }
    }
}

/// What a mention asserts: an entity sighting or a relationship between two
/// entity references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MentionKind {
    Entity {
        entity_type: String,
        /// Normalized surface form, e.g. "apple inc"
        value: String,
    },
    Relationship {
        rel_type: String,
        source: EntityRef,
        target: EntityRef,
    },
}

fn default_timestamp() -> DateTime<Utc> {
    Utc::now()
}

fn default_mention_id() -> MentionId {
    Uuid::new_v4()
}

/// A single extracted piece of evidence for an entity or relationship.
///
/// Owned by the caller until passed to `submit_batch`; never mutated by the
/// engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    #[serde(default = "default_mention_id")]
    pub id: MentionId,
    #[serde(flatten)]
    pub kind: MentionKind,
    /// Extraction confidence in [0, 1]
    pub confidence: f64,
    pub extraction_method: String,
    pub source_id: String,
    #[serde(default = "default_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub span: Option<TextSpan>,
    /// Free-form attribute payload; ordered so evaluation is deterministic.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
}

impl Mention {
    /// Build an entity mention with defaults (method "unknown", now()).
    pub fn entity(
        entity_type: impl Into<String>,
        value: impl Into<String>,
        source_id: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: MentionKind::Entity {
                entity_type: entity_type.into(),
                value: value.into(),
            },
            confidence,
            extraction_method: "unknown".to_string(),
            source_id: source_id.into(),
            timestamp: Utc::now(),
            span: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Build a relationship mention with defaults.
    pub fn relationship(
        rel_type: impl Into<String>,
        source: EntityRef,
        target: EntityRef,
        source_id: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: MentionKind::Relationship {
                rel_type: rel_type.into(),
                source,
                target,
            },
            confidence,
            extraction_method: "unknown".to_string(),
            source_id: source_id.into(),
            timestamp: Utc::now(),
            span: None,
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.extraction_method = method.into();
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_span(mut self, start: usize, end: usize) -> Self {
        self.span = Some(TextSpan { start, end });
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Reject malformed mentions before they touch any engine structure.
    pub fn validate(&self) -> Result<()> {
        match &self.kind {
            MentionKind::Entity { entity_type, value } => {
                if entity_type.trim().is_empty() {
                    return Err(GraphweldError::Validation(
                        "entity mention has empty type".to_string(),
                    ));
                }
                if value.trim().is_empty() {
                    return Err(GraphweldError::Validation(
                        "entity mention has empty normalized value".to_string(),
                    ));
                }
            }
            MentionKind::Relationship {
                rel_type,
                source,
                target,
            } => {
                if rel_type.trim().is_empty() {
                    return Err(GraphweldError::Validation(
                        "relationship mention has empty type".to_string(),
                    ));
                }
                for (side, endpoint) in [("source", source), ("target", target)] {
                    if endpoint.entity_type.trim().is_empty() || endpoint.value.trim().is_empty() {
                        return Err(GraphweldError::Validation(format!(
                            "relationship mention has malformed {} endpoint",
                            side
                        )));
                    }
                }
            }
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(GraphweldError::Validation(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if self.source_id.trim().is_empty() {
            return Err(GraphweldError::Validation(
                "mention has empty source id".to_string(),
            ));
        }
        for key in self.attributes.keys() {
            if key.trim().is_empty() {
                return Err(GraphweldError::Validation(
                    "mention attribute has empty key".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Content fingerprint (SHA-256, hex) over the mention's identity fields.
    ///
    /// Resubmitting a mention with an identical fingerprint is a no-op, which
    /// makes batch retries safe. The generated `id` is deliberately excluded
    /// so that a caller-side retry with a fresh id still deduplicates.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        match &self.kind {
            MentionKind::Entity { entity_type, value } => {
                hasher.update(b"entity\0");
                hasher.update(entity_type.as_bytes());
                hasher.update(b"\0");
                hasher.update(value.as_bytes());
            }
            MentionKind::Relationship {
                rel_type,
                source,
                target,
            } => {
                hasher.update(b"relationship\0");
                hasher.update(rel_type.as_bytes());
                hasher.update(b"\0");
                hasher.update(source.entity_type.as_bytes());
                hasher.update(b"\0");
                hasher.update(source.value.as_bytes());
                hasher.update(b"\0");
                hasher.update(target.entity_type.as_bytes());
                hasher.update(b"\0");
                hasher.update(target.value.as_bytes());
            }
        }
        hasher.update(b"\0");
        hasher.update(self.source_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.extraction_method.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.confidence.to_bits().to_le_bytes());
        if let Some(span) = &self.span {
            hasher.update(span.start.to_le_bytes());
            hasher.update(span.end.to_le_bytes());
        }
        for (key, value) in &self.attributes {
            hasher.update(b"\0");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.canonical_key().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_well_formed_entity() {
        let m = Mention::entity("ORG", "apple inc", "src-a", 0.9);
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_value() {
        let m = Mention::entity("ORG", "   ", "src-a", 0.9);
        let err = m.validate().unwrap_err();
        assert!(matches!(err, GraphweldError::Validation(_)));
    }

    #[test]
    fn test_validate_rejects_empty_type() {
        let m = Mention::entity("", "apple", "src-a", 0.9);
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_confidence() {
        let m = Mention::entity("ORG", "apple", "src-a", 1.5);
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_malformed_endpoint() {
        let m = Mention::relationship(
            "founded_by",
            EntityRef::new("ORG", "apple"),
            EntityRef::new("PERSON", ""),
            "src-a",
            0.8,
        );
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_fingerprint_stable_across_ids() {
        let ts = Utc::now();
        let a = Mention::entity("ORG", "apple", "src-a", 0.9).with_timestamp(ts);
        let b = Mention::entity("ORG", "apple", "src-a", 0.9).with_timestamp(ts);
        assert_ne!(a.id, b.id);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_differs_on_content() {
        let ts = Utc::now();
        let a = Mention::entity("ORG", "apple", "src-a", 0.9).with_timestamp(ts);
        let b = Mention::entity("ORG", "apple inc", "src-a", 0.9).with_timestamp(ts);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_covers_attributes() {
        let ts = Utc::now();
        let a = Mention::entity("ORG", "apple", "src-a", 0.9).with_timestamp(ts);
        let b = a
            .clone()
            .with_attribute("founded_year", AttrValue::Number(1976.0));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_attr_value_canonical_keys() {
        assert_eq!(AttrValue::Text(" x ".to_string()).canonical_key(), "s:x");
        assert_eq!(AttrValue::Number(1976.0).canonical_key(), "n:1976");
        // Same number through different arithmetic must share a key
        assert_eq!(
            AttrValue::Number(1000.0 + 976.0).canonical_key(),
            AttrValue::Number(1976.0).canonical_key()
        );
    }

    #[test]
    fn test_mention_serde_round_trip() {
        let m = Mention::entity("ORG", "apple", "src-a", 0.9)
            .with_attribute("hq", AttrValue::Text("cupertino".to_string()));
        let json = serde_json::to_string(&m).unwrap();
        let back: Mention = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn test_mention_deserialize_minimal_json() {
        // What an extraction component would emit as one JSONL line
        let json = r#"{
            "kind": "entity",
            "entity_type": "ORG",
            "value": "apple inc",
            "confidence": 0.92,
            "extraction_method": "ner-v2",
            "source_id": "crawl-17"
        }"#;
        let m: Mention = serde_json::from_str(json).unwrap();
        assert!(m.validate().is_ok());
        assert_eq!(m.source_id, "crawl-17");
        assert!(m.attributes.is_empty());
    }
}
