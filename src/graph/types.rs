//! Canonical graph records: revisioned entities, relationships, and
//! provenance-bearing attribute slots.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ledger::AssertionId;
use crate::model::{AttrValue, EntityId, MentionId, RelationshipId};

/// One attribute on a canonical entity or relationship.
///
/// `value` is the currently accepted value; it survives a dispute so readers
/// can still see the last accepted state alongside the `disputed` flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSlot {
    pub value: Option<AttrValue>,
    #[serde(default)]
    pub disputed: bool,
    /// Assertions supporting the accepted value
    #[serde(default)]
    pub provenance: Vec<AssertionId>,
    pub updated_revision: u64,
}

/// A canonical entity consolidated from one or more mentions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: EntityId,
    pub entity_type: String,
    /// Preferred surface form, taken from the highest-confidence mention
    pub value: String,
    /// Confidence of the mention that set `value`
    pub value_confidence: f64,
    /// Other observed surface forms
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeSlot>,
    /// Firm mention memberships, in attach order
    #[serde(default)]
    pub mention_ids: Vec<MentionId>,
    /// Mentions attached under ambiguous similarity
    #[serde(default)]
    pub tentative_mention_ids: Vec<MentionId>,
    /// Ledger sequence of this entity's creation; merges keep the oldest
    pub created_seq: u64,
    /// Graph revision of the last change to this record
    pub revision: u64,
    /// Set when this entity was absorbed by a merge. Always points directly
    /// at a live entity, never at another tombstone.
    #[serde(default)]
    pub merged_into: Option<EntityId>,
}

impl CanonicalEntity {
    pub fn is_live(&self) -> bool {
        self.merged_into.is_none()
    }

    /// All surface forms including the canonical one.
    pub fn surface_forms(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.value.as_str()).chain(self.aliases.iter().map(|s| s.as_str()))
    }
}

/// A canonical relationship. Identity is `(source, rel_type, target)`;
/// repeated observations fold into the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRelationship {
    pub id: RelationshipId,
    pub rel_type: String,
    pub source: EntityId,
    pub target: EntityId,
    /// Highest confidence observed across supporting mentions
    pub confidence: f64,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeSlot>,
    #[serde(default)]
    pub mention_ids: Vec<MentionId>,
    pub created_seq: u64,
    pub revision: u64,
    /// Set when an entity merge collapsed this edge into another record.
    /// Always points directly at a live relationship.
    #[serde(default)]
    pub merged_into: Option<RelationshipId>,
}

impl CanonicalRelationship {
    pub fn is_live(&self) -> bool {
        self.merged_into.is_none()
    }
}

/// Point-in-time view of the graph, or a delta when `since_revision` was
/// given. Tombstoned entities and relationships whose revision is in range
/// are included so consumers can follow redirects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub revision: u64,
    pub entities: Vec<CanonicalEntity>,
    pub relationships: Vec<CanonicalRelationship>,
}

impl GraphSnapshot {
    pub fn live_entities(&self) -> impl Iterator<Item = &CanonicalEntity> {
        self.entities.iter().filter(|e| e.is_live())
    }

    pub fn live_relationships(&self) -> impl Iterator<Item = &CanonicalRelationship> {
        self.relationships.iter().filter(|r| r.is_live())
    }
}

/// Side effects of a merge that the engine must log and persist.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Relationships whose endpoints were rewritten onto the survivor
    pub rewritten_relationships: Vec<RelationshipId>,
    /// Relationships tombstoned because the rewrite collided with an
    /// existing record: (folded, kept)
    pub folded_relationships: Vec<(RelationshipId, RelationshipId)>,
}
