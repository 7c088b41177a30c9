//! In-memory canonical graph: revisioned entities and relationships, merge
//! tombstones with single-hop redirects, and BFS neighborhood traversal.
//!
//! The graph is a plain data structure; the engine serializes access to it.
//! Every mutation stamps the touched records with a fresh global revision so
//! callers can ask for deltas and the analyzer can key its cache.

mod types;

pub use types::{
    AttributeSlot, CanonicalEntity, CanonicalRelationship, GraphSnapshot, MergeOutcome,
};

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use uuid::Uuid;

use crate::error::{GraphweldError, Result};
use crate::ledger::AssertionId;
use crate::model::{AttrValue, EntityId, MentionId, RelationshipId, SubjectId};

type RelKey = (EntityId, String, EntityId);

#[derive(Default)]
pub struct CanonicalGraph {
    entities: HashMap<EntityId, CanonicalEntity>,
    relationships: HashMap<RelationshipId, CanonicalRelationship>,
    /// Identity index: (source, rel_type, target) -> relationship
    rel_index: HashMap<RelKey, RelationshipId>,
    /// Relationships incident to each live entity
    incidence: HashMap<EntityId, BTreeSet<RelationshipId>>,
    revision: u64,
}

impl CanonicalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Collapse a merge redirect. Tombstones always point directly at a live
    /// entity, so this is a single hop.
    pub fn resolve_id(&self, id: EntityId) -> Option<EntityId> {
        let entity = self.entities.get(&id)?;
        match entity.merged_into {
            Some(target) => Some(target),
            None => Some(id),
        }
    }

    /// Fetch an entity, following its redirect if it was merged away.
    pub fn entity(&self, id: EntityId) -> Option<&CanonicalEntity> {
        let resolved = self.resolve_id(id)?;
        self.entities.get(&resolved)
    }

    /// Fetch the record at exactly this id, tombstone or not.
    pub fn entity_unresolved(&self, id: EntityId) -> Option<&CanonicalEntity> {
        self.entities.get(&id)
    }

    /// Collapse a relationship fold redirect, single hop like [`resolve_id`](Self::resolve_id).
    pub fn resolve_rel_id(&self, id: RelationshipId) -> Option<RelationshipId> {
        let rel = self.relationships.get(&id)?;
        match rel.merged_into {
            Some(target) => Some(target),
            None => Some(id),
        }
    }

    /// Fetch a relationship, following its redirect if a merge folded it.
    pub fn relationship(&self, id: RelationshipId) -> Option<&CanonicalRelationship> {
        let resolved = self.resolve_rel_id(id)?;
        self.relationships.get(&resolved)
    }

    /// Fetch the relationship record at exactly this id, tombstone or not.
    pub fn relationship_unresolved(&self, id: RelationshipId) -> Option<&CanonicalRelationship> {
        self.relationships.get(&id)
    }

    /// Collapse a subject through its merge redirect, if any. Subjects the
    /// graph has never seen pass through unchanged.
    pub fn resolve_subject(&self, subject: SubjectId) -> SubjectId {
        match subject {
            SubjectId::Entity(id) => SubjectId::Entity(self.resolve_id(id).unwrap_or(id)),
            SubjectId::Relationship(id) => {
                SubjectId::Relationship(self.resolve_rel_id(id).unwrap_or(id))
            }
        }
    }

    pub fn find_relationship(
        &self,
        source: EntityId,
        rel_type: &str,
        target: EntityId,
    ) -> Option<RelationshipId> {
        self.rel_index
            .get(&(source, rel_type.to_string(), target))
            .copied()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.values().filter(|e| e.is_live()).count()
    }

    pub fn tombstone_count(&self) -> usize {
        self.entities.values().filter(|e| !e.is_live()).count()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.values().filter(|r| r.is_live()).count()
    }

    pub fn live_entities(&self) -> impl Iterator<Item = &CanonicalEntity> {
        self.entities.values().filter(|e| e.is_live())
    }

    /// Ids of live entities in sorted order, the iteration order used by
    /// the analyzer for determinism.
    pub fn live_entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.is_live())
            .map(|e| e.id)
            .collect();
        ids.sort();
        ids
    }

    /// All ids that resolve to `id`: the entity itself plus every tombstone
    /// redirecting to it. Used to assemble full provenance across merges.
    pub fn absorbed_ids(&self, id: EntityId) -> Vec<EntityId> {
        let Some(live) = self.resolve_id(id) else {
            return Vec::new();
        };
        let mut ids: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.id == live || e.merged_into == Some(live))
            .map(|e| e.id)
            .collect();
        ids.sort();
        ids
    }

    /// Relationship ids folded into the record `id` resolves to, plus that
    /// record itself.
    pub fn absorbed_relationship_ids(&self, id: RelationshipId) -> Vec<RelationshipId> {
        let Some(live) = self.resolve_rel_id(id) else {
            return Vec::new();
        };
        let mut ids: Vec<RelationshipId> = self
            .relationships
            .values()
            .filter(|r| r.id == live || r.merged_into == Some(live))
            .map(|r| r.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn create_entity(
        &mut self,
        entity_type: impl Into<String>,
        value: impl Into<String>,
        confidence: f64,
        created_seq: u64,
    ) -> EntityId {
        self.create_entity_with_id(Uuid::new_v4(), entity_type, value, confidence, created_seq)
    }

    /// Create an entity under a caller-chosen id, as when replaying ledger
    /// entries that already name the entity.
    pub fn create_entity_with_id(
        &mut self,
        id: EntityId,
        entity_type: impl Into<String>,
        value: impl Into<String>,
        confidence: f64,
        created_seq: u64,
    ) -> EntityId {
        let rev = self.bump();
        self.entities.insert(
            id,
            CanonicalEntity {
                id,
                entity_type: entity_type.into(),
                value: value.into(),
                value_confidence: confidence,
                aliases: BTreeSet::new(),
                attributes: BTreeMap::new(),
                mention_ids: Vec::new(),
                tentative_mention_ids: Vec::new(),
                created_seq,
                revision: rev,
                merged_into: None,
            },
        );
        self.incidence.entry(id).or_default();
        id
    }

    /// Record a surface form observation. Higher-confidence forms take over
    /// as the canonical value; the old value drops to the alias set.
    pub fn observe_surface_form(
        &mut self,
        id: EntityId,
        surface: &str,
        confidence: f64,
    ) -> Result<()> {
        let resolved = self
            .resolve_id(id)
            .ok_or_else(|| GraphweldError::NotFound(format!("entity {}", id)))?;
        let rev = self.revision + 1;
        let entity = self
            .entities
            .get_mut(&resolved)
            .ok_or_else(|| GraphweldError::NotFound(format!("entity {}", resolved)))?;

        let changed = if surface == entity.value {
            if confidence > entity.value_confidence {
                entity.value_confidence = confidence;
                true
            } else {
                false
            }
        } else if confidence > entity.value_confidence {
            let old = std::mem::replace(&mut entity.value, surface.to_string());
            entity.aliases.insert(old);
            entity.aliases.remove(surface);
            entity.value_confidence = confidence;
            true
        } else {
            entity.aliases.insert(surface.to_string())
        };

        if changed {
            entity.revision = rev;
            self.revision = rev;
        }
        Ok(())
    }

    /// Attach a mention to an entity or relationship. Attaching the same
    /// mention twice is a no-op; a firm attach promotes an earlier tentative
    /// one instead of duplicating it.
    pub fn attach_mention(
        &mut self,
        subject: SubjectId,
        mention_id: MentionId,
        tentative: bool,
    ) -> Result<()> {
        let rev = self.revision + 1;
        match subject {
            SubjectId::Entity(id) => {
                let resolved = self
                    .resolve_id(id)
                    .ok_or_else(|| GraphweldError::NotFound(format!("entity {}", id)))?;
                let entity = self
                    .entities
                    .get_mut(&resolved)
                    .ok_or_else(|| GraphweldError::NotFound(format!("entity {}", resolved)))?;
                if entity.mention_ids.contains(&mention_id) {
                    return Ok(());
                }
                if tentative {
                    if entity.tentative_mention_ids.contains(&mention_id) {
                        return Ok(());
                    }
                    entity.tentative_mention_ids.push(mention_id);
                } else {
                    entity.tentative_mention_ids.retain(|m| *m != mention_id);
                    entity.mention_ids.push(mention_id);
                }
                entity.revision = rev;
            }
            SubjectId::Relationship(id) => {
                let rel = self
                    .relationships
                    .get_mut(&id)
                    .ok_or_else(|| GraphweldError::NotFound(format!("relationship {}", id)))?;
                if rel.mention_ids.contains(&mention_id) {
                    return Ok(());
                }
                rel.mention_ids.push(mention_id);
                rel.revision = rev;
            }
        }
        self.revision = rev;
        Ok(())
    }

    fn slot_mut(&mut self, subject: SubjectId, attr: &str) -> Result<&mut AttributeSlot> {
        let rev = self.revision;
        let attrs = match subject {
            SubjectId::Entity(id) => {
                let resolved = self
                    .resolve_id(id)
                    .ok_or_else(|| GraphweldError::NotFound(format!("entity {}", id)))?;
                &mut self
                    .entities
                    .get_mut(&resolved)
                    .ok_or_else(|| GraphweldError::NotFound(format!("entity {}", resolved)))?
                    .attributes
            }
            SubjectId::Relationship(id) => {
                &mut self
                    .relationships
                    .get_mut(&id)
                    .ok_or_else(|| GraphweldError::NotFound(format!("relationship {}", id)))?
                    .attributes
            }
        };
        Ok(attrs.entry(attr.to_string()).or_insert(AttributeSlot {
            value: None,
            disputed: false,
            provenance: Vec::new(),
            updated_revision: rev,
        }))
    }

    fn stamp_subject(&mut self, subject: SubjectId, rev: u64) {
        match subject {
            SubjectId::Entity(id) => {
                if let Some(resolved) = self.resolve_id(id) {
                    if let Some(e) = self.entities.get_mut(&resolved) {
                        e.revision = rev;
                    }
                }
            }
            SubjectId::Relationship(id) => {
                if let Some(r) = self.relationships.get_mut(&id) {
                    r.revision = rev;
                }
            }
        }
        self.revision = rev;
    }

    /// Accept a value into an attribute slot, clearing any dispute.
    pub fn accept_attribute(
        &mut self,
        subject: SubjectId,
        attr: &str,
        value: AttrValue,
        assertion: AssertionId,
    ) -> Result<()> {
        let rev = self.revision + 1;
        let slot = self.slot_mut(subject, attr)?;
        if slot.value.as_ref().map(|v| v.canonical_key()) != Some(value.canonical_key()) {
            // new accepted value: prior supporters no longer apply
            slot.provenance.clear();
        }
        slot.value = Some(value);
        slot.disputed = false;
        if !slot.provenance.contains(&assertion) {
            slot.provenance.push(assertion);
        }
        slot.updated_revision = rev;
        self.stamp_subject(subject, rev);
        Ok(())
    }

    /// Register another assertion supporting the already-accepted value.
    pub fn corroborate_attribute(
        &mut self,
        subject: SubjectId,
        attr: &str,
        assertion: AssertionId,
    ) -> Result<()> {
        let rev = self.revision + 1;
        let slot = self.slot_mut(subject, attr)?;
        if !slot.provenance.contains(&assertion) {
            slot.provenance.push(assertion);
        }
        slot.updated_revision = rev;
        self.stamp_subject(subject, rev);
        Ok(())
    }

    /// Flag a slot as disputed. The last accepted value stays visible.
    pub fn dispute_attribute(&mut self, subject: SubjectId, attr: &str) -> Result<()> {
        let rev = self.revision + 1;
        let slot = self.slot_mut(subject, attr)?;
        slot.disputed = true;
        slot.updated_revision = rev;
        self.stamp_subject(subject, rev);
        Ok(())
    }

    pub fn slot(&self, subject: SubjectId, attr: &str) -> Option<&AttributeSlot> {
        match subject {
            SubjectId::Entity(id) => {
                let resolved = self.resolve_id(id)?;
                self.entities.get(&resolved)?.attributes.get(attr)
            }
            SubjectId::Relationship(id) => self.relationships.get(&id)?.attributes.get(attr),
        }
    }

    /// Insert or fold a relationship observation. Endpoints are resolved
    /// through redirects first. Returns the id and whether it was created.
    pub fn upsert_relationship(
        &mut self,
        rel_type: &str,
        source: EntityId,
        target: EntityId,
        confidence: f64,
        created_seq: u64,
    ) -> Result<(RelationshipId, bool)> {
        self.upsert_relationship_with_id(
            Uuid::new_v4(),
            rel_type,
            source,
            target,
            confidence,
            created_seq,
        )
    }

    /// Like [`upsert_relationship`](Self::upsert_relationship) but uses a
    /// caller-chosen id when the observation creates a new relationship.
    pub fn upsert_relationship_with_id(
        &mut self,
        id: RelationshipId,
        rel_type: &str,
        source: EntityId,
        target: EntityId,
        confidence: f64,
        created_seq: u64,
    ) -> Result<(RelationshipId, bool)> {
        let source = self
            .resolve_id(source)
            .ok_or_else(|| GraphweldError::NotFound(format!("entity {}", source)))?;
        let target = self
            .resolve_id(target)
            .ok_or_else(|| GraphweldError::NotFound(format!("entity {}", target)))?;

        let key = (source, rel_type.to_string(), target);
        if let Some(&existing) = self.rel_index.get(&key) {
            let rev = self.bump();
            let rel = self
                .relationships
                .get_mut(&existing)
                .ok_or_else(|| GraphweldError::NotFound(format!("relationship {}", existing)))?;
            if confidence > rel.confidence {
                rel.confidence = confidence;
            }
            rel.revision = rev;
            return Ok((existing, false));
        }

        let rev = self.bump();
        self.relationships.insert(
            id,
            CanonicalRelationship {
                id,
                rel_type: rel_type.to_string(),
                source,
                target,
                confidence,
                attributes: BTreeMap::new(),
                mention_ids: Vec::new(),
                created_seq,
                revision: rev,
                merged_into: None,
            },
        );
        self.rel_index.insert(key, id);
        self.incidence.entry(source).or_default().insert(id);
        self.incidence.entry(target).or_default().insert(id);
        Ok((id, true))
    }

    /// Raise a relationship's confidence after a repeat observation. Keeps
    /// the maximum seen so far.
    pub fn boost_relationship_confidence(
        &mut self,
        id: RelationshipId,
        confidence: f64,
    ) -> Result<()> {
        let rev = self.bump();
        let rel = self
            .relationships
            .get_mut(&id)
            .ok_or_else(|| GraphweldError::NotFound(format!("relationship {}", id)))?;
        if confidence > rel.confidence {
            rel.confidence = confidence;
        }
        rel.revision = rev;
        Ok(())
    }

    /// Fold `dropped` into `kept` after an endpoint rewrite made them
    /// identical. The dropped record stays behind as a tombstone pointing at
    /// `kept`, so edge ids held by external consumers keep resolving.
    fn fold_relationship(&mut self, dropped: RelationshipId, kept: RelationshipId, rev: u64) {
        let (endpoints, mentions, attributes, confidence, created_seq) = {
            let Some(rel) = self.relationships.get_mut(&dropped) else {
                return;
            };
            rel.merged_into = Some(kept);
            rel.revision = rev;
            (
                [rel.source, rel.target],
                std::mem::take(&mut rel.mention_ids),
                rel.attributes.clone(),
                rel.confidence,
                rel.created_seq,
            )
        };
        for end in endpoints {
            if let Some(set) = self.incidence.get_mut(&end) {
                set.remove(&dropped);
            }
        }
        // earlier folds onto the dropped record must stay single-hop
        for rel in self.relationships.values_mut() {
            if rel.merged_into == Some(dropped) {
                rel.merged_into = Some(kept);
                rel.revision = rev;
            }
        }
        if let Some(kept_rel) = self.relationships.get_mut(&kept) {
            if confidence > kept_rel.confidence {
                kept_rel.confidence = confidence;
            }
            for m in mentions {
                if !kept_rel.mention_ids.contains(&m) {
                    kept_rel.mention_ids.push(m);
                }
            }
            for (k, slot) in attributes {
                kept_rel.attributes.entry(k).or_insert(slot);
            }
            if created_seq < kept_rel.created_seq {
                kept_rel.created_seq = created_seq;
            }
            kept_rel.revision = rev;
        }
    }

    /// Fold `losers` into `winner`: union mentions and aliases, copy missing
    /// attributes, rewrite relationship endpoints, and leave each loser as a
    /// tombstone pointing directly at the winner. Existing redirects onto a
    /// loser are rewritten too, preserving the single-hop invariant.
    pub fn apply_merge(&mut self, winner: EntityId, losers: &[EntityId]) -> Result<MergeOutcome> {
        let winner_entity = self
            .entities
            .get(&winner)
            .ok_or_else(|| GraphweldError::NotFound(format!("entity {}", winner)))?;
        if !winner_entity.is_live() {
            return Err(GraphweldError::MergeCycle(format!(
                "merge target {} is itself a tombstone",
                winner
            )));
        }
        for loser in losers {
            if *loser == winner {
                return Err(GraphweldError::MergeCycle(format!(
                    "entity {} cannot absorb itself",
                    winner
                )));
            }
            let entity = self
                .entities
                .get(loser)
                .ok_or_else(|| GraphweldError::NotFound(format!("entity {}", loser)))?;
            if !entity.is_live() {
                return Err(GraphweldError::MergeCycle(format!(
                    "entity {} was already merged into {}",
                    loser,
                    entity.merged_into.map(|id| id.to_string()).unwrap_or_default()
                )));
            }
        }

        let rev = self.bump();
        let mut outcome = MergeOutcome::default();

        for &loser_id in losers {
            let mut loser = self
                .entities
                .remove(&loser_id)
                .ok_or_else(|| GraphweldError::NotFound(format!("entity {}", loser_id)))?;

            {
                let winner_entity = self
                    .entities
                    .get_mut(&winner)
                    .ok_or_else(|| GraphweldError::NotFound(format!("entity {}", winner)))?;

                for m in loser.mention_ids.drain(..) {
                    if !winner_entity.mention_ids.contains(&m) {
                        winner_entity.tentative_mention_ids.retain(|t| *t != m);
                        winner_entity.mention_ids.push(m);
                    }
                }
                for m in loser.tentative_mention_ids.drain(..) {
                    if !winner_entity.mention_ids.contains(&m)
                        && !winner_entity.tentative_mention_ids.contains(&m)
                    {
                        winner_entity.tentative_mention_ids.push(m);
                    }
                }

                if loser.value_confidence > winner_entity.value_confidence {
                    let old = std::mem::replace(&mut winner_entity.value, loser.value.clone());
                    winner_entity.aliases.insert(old);
                    winner_entity.value_confidence = loser.value_confidence;
                } else if loser.value != winner_entity.value {
                    winner_entity.aliases.insert(loser.value.clone());
                }
                for alias in &loser.aliases {
                    if *alias != winner_entity.value {
                        winner_entity.aliases.insert(alias.clone());
                    }
                }
                let canonical = winner_entity.value.clone();
                winner_entity.aliases.remove(&canonical);

                // winner keeps its own slots on collision; the loser's values
                // stay reachable through its ledger history
                for (key, slot) in &loser.attributes {
                    match winner_entity.attributes.get(key) {
                        Some(existing) if existing.value.is_some() || existing.disputed => {}
                        _ => {
                            winner_entity.attributes.insert(key.clone(), slot.clone());
                        }
                    }
                }

                if loser.created_seq < winner_entity.created_seq {
                    winner_entity.created_seq = loser.created_seq;
                }
            }

            // rewrite redirects that pointed at the loser
            for entity in self.entities.values_mut() {
                if entity.merged_into == Some(loser_id) {
                    entity.merged_into = Some(winner);
                    entity.revision = rev;
                }
            }

            // rewrite incident relationships onto the winner
            let rel_ids: Vec<RelationshipId> = self
                .incidence
                .remove(&loser_id)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default();
            for rel_id in rel_ids {
                if !self
                    .relationships
                    .get(&rel_id)
                    .is_some_and(|r| r.is_live())
                {
                    continue; // already folded via an earlier loser
                }
                let (old_key, new_key) = {
                    let rel = self.relationships.get_mut(&rel_id).ok_or_else(|| {
                        GraphweldError::NotFound(format!("relationship {}", rel_id))
                    })?;
                    let old_key = (rel.source, rel.rel_type.clone(), rel.target);
                    if rel.source == loser_id {
                        rel.source = winner;
                    }
                    if rel.target == loser_id {
                        rel.target = winner;
                    }
                    rel.revision = rev;
                    (old_key, (rel.source, rel.rel_type.clone(), rel.target))
                };
                self.rel_index.remove(&old_key);

                match self.rel_index.get(&new_key).copied() {
                    Some(existing) if existing != rel_id => {
                        // identity collision: keep the older record
                        let keep_existing = match (
                            self.relationships.get(&existing),
                            self.relationships.get(&rel_id),
                        ) {
                            (Some(a), Some(b)) => (a.created_seq, a.id) < (b.created_seq, b.id),
                            _ => true,
                        };
                        let (kept, dropped) = if keep_existing {
                            (existing, rel_id)
                        } else {
                            (rel_id, existing)
                        };
                        self.fold_relationship(dropped, kept, rev);
                        self.rel_index.insert(new_key.clone(), kept);
                        self.incidence.entry(new_key.0).or_default().insert(kept);
                        self.incidence.entry(new_key.2).or_default().insert(kept);
                        outcome.folded_relationships.push((dropped, kept));
                    }
                    _ => {
                        self.rel_index.insert(new_key.clone(), rel_id);
                        self.incidence.entry(new_key.0).or_default().insert(rel_id);
                        self.incidence.entry(new_key.2).or_default().insert(rel_id);
                        outcome.rewritten_relationships.push(rel_id);
                    }
                }
            }

            loser.merged_into = Some(winner);
            loser.revision = rev;
            self.entities.insert(loser_id, loser);
        }

        if let Some(winner_entity) = self.entities.get_mut(&winner) {
            winner_entity.revision = rev;
        }
        Ok(outcome)
    }

    /// Distinct neighbor entities of `id` with the relationship connecting
    /// them, sorted for stable output.
    pub fn neighbors(&self, id: EntityId) -> Vec<(RelationshipId, EntityId)> {
        let Some(resolved) = self.resolve_id(id) else {
            return Vec::new();
        };
        let mut out: Vec<(RelationshipId, EntityId)> = Vec::new();
        if let Some(rel_ids) = self.incidence.get(&resolved) {
            for rel_id in rel_ids {
                if let Some(rel) = self.relationships.get(rel_id) {
                    let other = if rel.source == resolved {
                        rel.target
                    } else {
                        rel.source
                    };
                    out.push((*rel_id, other));
                }
            }
        }
        out.sort_by_key(|(rel_id, other)| (*other, *rel_id));
        out
    }

    /// Relationships reachable from `start` within `max_depth` hops,
    /// following edges in both directions.
    pub fn neighborhood(&self, start: EntityId, max_depth: usize) -> Vec<CanonicalRelationship> {
        let Some(start) = self.resolve_id(start) else {
            return Vec::new();
        };
        let mut visited = BTreeSet::new();
        let mut seen_rels = BTreeSet::new();
        let mut queue = VecDeque::new();
        let mut result = Vec::new();

        queue.push_back((start, 0usize));
        visited.insert(start);

        while let Some((entity, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for (rel_id, other) in self.neighbors(entity) {
                if seen_rels.insert(rel_id) {
                    if let Some(rel) = self.relationships.get(&rel_id) {
                        result.push(rel.clone());
                    }
                }
                if visited.insert(other) {
                    queue.push_back((other, depth + 1));
                }
            }
        }
        result
    }

    /// Undirected adjacency over live entities, self-loops excluded. This is
    /// the view centrality operates on.
    pub fn adjacency(&self) -> BTreeMap<EntityId, BTreeSet<EntityId>> {
        let mut adj: BTreeMap<EntityId, BTreeSet<EntityId>> = BTreeMap::new();
        for id in self.live_entity_ids() {
            adj.entry(id).or_default();
        }
        for rel in self.relationships.values().filter(|r| r.is_live()) {
            if rel.source == rel.target {
                continue;
            }
            adj.entry(rel.source).or_default().insert(rel.target);
            adj.entry(rel.target).or_default().insert(rel.source);
        }
        adj
    }

    /// Full snapshot, or the records touched after `since_revision`.
    pub fn snapshot(&self, since_revision: Option<u64>) -> GraphSnapshot {
        let since = since_revision.unwrap_or(0);
        let mut entities: Vec<CanonicalEntity> = self
            .entities
            .values()
            .filter(|e| e.revision > since)
            .cloned()
            .collect();
        entities.sort_by_key(|e| e.id);
        let mut relationships: Vec<CanonicalRelationship> = self
            .relationships
            .values()
            .filter(|r| r.revision > since)
            .cloned()
            .collect();
        relationships.sort_by_key(|r| r.id);
        GraphSnapshot {
            revision: self.revision,
            entities,
            relationships,
        }
    }

    /// Restore a record loaded from storage, keeping indexes consistent.
    /// Used when opening a persisted graph; does not bump the revision.
    pub fn restore_entity(&mut self, entity: CanonicalEntity) {
        if entity.revision > self.revision {
            self.revision = entity.revision;
        }
        if entity.is_live() {
            self.incidence.entry(entity.id).or_default();
        }
        self.entities.insert(entity.id, entity);
    }

    pub fn restore_relationship(&mut self, rel: CanonicalRelationship) {
        if rel.revision > self.revision {
            self.revision = rel.revision;
        }
        // tombstones stay out of the identity index and incidence sets, or a
        // folded edge could shadow the record that absorbed it
        if rel.is_live() {
            self.rel_index
                .insert((rel.source, rel.rel_type.clone(), rel.target), rel.id);
            self.incidence.entry(rel.source).or_default().insert(rel.id);
            self.incidence.entry(rel.target).or_default().insert(rel.id);
        }
        self.relationships.insert(rel.id, rel);
    }
}
