//! The consolidation engine: accepts mention batches and maintains the
//! ledger, the canonical graph, the block index, and the conflict book as
//! one consistent unit.
//!
//! Writes follow a WAL discipline. For each mention the engine decides under
//! a read lock, then appends the resulting assertions to the ledger before
//! mutating any canonical structure, then persists the touched records.
//! Block locks serialize mentions that could race on the same candidates;
//! entity locks cover the specific entities a decision touches. Both are
//! acquired in sorted order (see [`LockManager`]). State is consistent at
//! every mention boundary, so callers may drop the `submit_batch` future
//! between mentions without corrupting the graph; a mention lost mid-flight
//! is safe to resubmit thanks to fingerprint deduplication.

mod locks;
mod replay;

pub use locks::LockManager;
pub use replay::{ReplayReport, ReplayedState};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::analyzer::{CentralityRanking, GraphAnalyzer, Measure};
use crate::conflict::{
    ConflictBook, ConflictFilter, ConflictId, ConflictRecord, Evaluation,
};
use crate::config::Config;
use crate::error::Result;
use crate::graph::{
    CanonicalEntity, CanonicalGraph, CanonicalRelationship, GraphSnapshot,
};
use crate::ledger::{Assertion, AssertionId, LedgerEntry, LedgerOp, ProvenanceLedger};
use crate::model::{
    AttrValue, EntityId, EntityRef, Mention, MentionKind, RelationshipId, SubjectId,
};
use crate::resolver::{EntityResolver, ResolutionDecision};
use crate::store::{GraphStore, MemoryStore};

/// Extraction method recorded for operator decisions. Replay treats these
/// assertions as forced accepts rather than re-running the policy.
pub const MANUAL_METHOD: &str = "manual";
/// Source id recorded for operator decisions.
pub const OPERATOR_SOURCE: &str = "operator";

/// Per-batch accounting returned by `submit_batch`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchReport {
    pub mentions: usize,
    pub accepted: usize,
    /// Accepted mentions that left at least one attribute slot disputed
    pub disputed: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub entities_created: usize,
    pub merges: usize,
    pub tentative_attachments: usize,
    pub relationships_created: usize,
    pub conflicts_opened: usize,
    pub conflicts_resolved: usize,
}

impl BatchReport {
    fn absorb(&mut self, counters: Counters) {
        self.disputed += counters.disputed;
        self.entities_created += counters.entities_created;
        self.merges += counters.merges;
        self.tentative_attachments += counters.tentative;
        self.relationships_created += counters.relationships_created;
        self.conflicts_opened += counters.conflicts_opened;
        self.conflicts_resolved += counters.conflicts_resolved;
    }
}

/// Point-in-time counters for the stats command.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub live_entities: usize,
    pub tombstones: usize,
    pub relationships: usize,
    pub ledger_entries: usize,
    pub open_conflicts: usize,
    pub total_conflicts: usize,
    pub revision: u64,
    pub blocks: usize,
    pub block_postings: usize,
    pub max_block_size: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    disputed: usize,
    entities_created: usize,
    merges: usize,
    tentative: usize,
    relationships_created: usize,
    conflicts_opened: usize,
    conflicts_resolved: usize,
}

enum MentionOutcome {
    Duplicate,
    Applied(Counters),
}

/// Everything one mention changed, collected under the write lock so
/// persistence can run after it is released.
#[derive(Default)]
struct ApplyOutcome {
    entries: Vec<LedgerEntry>,
    entity_ids: BTreeSet<EntityId>,
    relationship_ids: BTreeSet<RelationshipId>,
    conflict_ids: BTreeSet<ConflictId>,
    counters: Counters,
    entities: Vec<CanonicalEntity>,
    relationships: Vec<CanonicalRelationship>,
    conflicts: Vec<ConflictRecord>,
}

impl ApplyOutcome {
    /// Clone the final state of every touched record for persistence.
    fn finish(&mut self, graph: &CanonicalGraph, conflicts: &ConflictBook) {
        for id in &self.entity_ids {
            if let Some(entity) = graph.entity_unresolved(*id) {
                self.entities.push(entity.clone());
            }
        }
        for id in &self.relationship_ids {
            if let Some(rel) = graph.relationship_unresolved(*id) {
                self.relationships.push(rel.clone());
            }
        }
        for id in &self.conflict_ids {
            if let Some(record) = conflicts.get(*id) {
                self.conflicts.push(record.clone());
            }
        }
    }
}

/// Rows a failed persist left unwritten. The ledger and in-memory state
/// already hold them; the store catches up on the next write path. Parked
/// rows are safe to write twice: ledger appends are idempotent on seq and
/// the canonical saves are upserts.
#[derive(Default)]
struct WriteBacklog {
    entries: Vec<LedgerEntry>,
    entities: Vec<CanonicalEntity>,
    relationships: Vec<CanonicalRelationship>,
    conflicts: Vec<ConflictRecord>,
}

impl WriteBacklog {
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.entities.is_empty()
            && self.relationships.is_empty()
            && self.conflicts.is_empty()
    }

    fn len(&self) -> usize {
        self.entries.len() + self.entities.len() + self.relationships.len() + self.conflicts.len()
    }

    fn absorb(&mut self, outcome: &ApplyOutcome) {
        self.entries.extend(outcome.entries.iter().cloned());
        self.entities.extend(outcome.entities.iter().cloned());
        self.relationships
            .extend(outcome.relationships.iter().cloned());
        self.conflicts.extend(outcome.conflicts.iter().cloned());
    }
}

/// Translate a conflict evaluation into the graph mutation it implies.
pub(crate) fn apply_evaluation(
    graph: &mut CanonicalGraph,
    subject: SubjectId,
    attr: &str,
    eval: &Evaluation,
    assertion: AssertionId,
) -> Result<()> {
    match eval {
        Evaluation::Accepted { value, .. } => {
            graph.accept_attribute(subject, attr, value.clone(), assertion)
        }
        Evaluation::Corroborated { .. } => graph.corroborate_attribute(subject, attr, assertion),
        Evaluation::Superseded { .. } => Ok(()),
        Evaluation::Disputed { .. } => graph.dispute_attribute(subject, attr),
    }
}

/// Mirror a subject's attribute slots into the book's accepted keys.
/// `retarget` folds competing histories together, but only the graph knows
/// which value each merged slot ended up holding; the book must agree before
/// the next assertion against the slot is evaluated.
pub(crate) fn mirror_accepted(
    graph: &CanonicalGraph,
    conflicts: &mut ConflictBook,
    subject: SubjectId,
) {
    let slots: Vec<(String, Option<String>)> = match subject {
        SubjectId::Entity(id) => graph.entity(id).map(|e| &e.attributes),
        SubjectId::Relationship(id) => graph.relationship(id).map(|r| &r.attributes),
    }
    .map(|attrs| {
        attrs
            .iter()
            .map(|(attr, slot)| {
                (
                    attr.clone(),
                    slot.value.as_ref().map(|v| v.canonical_key()),
                )
            })
            .collect()
    })
    .unwrap_or_default();
    for (attr, key) in slots {
        conflicts.set_accepted(subject, &attr, key);
    }
}

/// Collapse a decision made under the read lock through any merges that
/// landed before the write lock was acquired.
fn revalidate(graph: &CanonicalGraph, decision: ResolutionDecision) -> ResolutionDecision {
    match decision {
        ResolutionDecision::CreateNew => ResolutionDecision::CreateNew,
        ResolutionDecision::Attach {
            entity_id,
            score,
            tentative,
        } => match graph.resolve_id(entity_id) {
            Some(id) => ResolutionDecision::Attach {
                entity_id: id,
                score,
                tentative,
            },
            None => ResolutionDecision::CreateNew,
        },
        ResolutionDecision::Merge { group, score } => {
            let mut resolved: Vec<(u64, EntityId)> = group
                .iter()
                .filter_map(|id| graph.resolve_id(*id))
                .filter_map(|id| graph.entity_unresolved(id).map(|e| (e.created_seq, e.id)))
                .collect();
            resolved.sort();
            resolved.dedup();
            let ids: Vec<EntityId> = resolved.into_iter().map(|(_, id)| id).collect();
            match ids.len() {
                0 => ResolutionDecision::CreateNew,
                1 => ResolutionDecision::Attach {
                    entity_id: ids[0],
                    score,
                    tentative: false,
                },
                _ => ResolutionDecision::Merge { group: ids, score },
            }
        }
    }
}

fn decision_targets(decision: &ResolutionDecision) -> Vec<EntityId> {
    match decision {
        ResolutionDecision::CreateNew => Vec::new(),
        ResolutionDecision::Attach { entity_id, .. } => vec![*entity_id],
        ResolutionDecision::Merge { group, .. } => group.clone(),
    }
}

/// Mutable state guarded by the engine's RwLock. The ledger lives outside:
/// it is internally synchronized and appended to while this lock is held.
struct EngineState {
    graph: CanonicalGraph,
    resolver: EntityResolver,
    conflicts: ConflictBook,
    /// Mention fingerprint -> first mention id seen with it
    fingerprints: HashMap<String, Uuid>,
}

pub struct ConsolidationEngine {
    config: Config,
    store: Arc<dyn GraphStore>,
    /// Rows an earlier failed persist still owes the store
    backlog: Mutex<WriteBacklog>,
    state: RwLock<EngineState>,
    ledger: ProvenanceLedger,
    locks: LockManager,
    analyzer: GraphAnalyzer,
}

impl ConsolidationEngine {
    /// Open an engine over a store, restoring ledger, graph, block index,
    /// and conflict book from whatever the store holds.
    pub async fn open(config: Config, store: Arc<dyn GraphStore>) -> Result<Self> {
        let entries = store.load_ledger().await?;
        let stored_conflicts = store.load_conflicts().await?;

        let mut graph = CanonicalGraph::new();
        for entity in store.load_entities().await? {
            graph.restore_entity(entity);
        }
        for rel in store.load_relationships().await? {
            graph.restore_relationship(rel);
        }

        let mut resolver = EntityResolver::new(config.resolver.clone());
        resolver.rebuild_from(&graph);

        let mut conflicts = ConflictBook::new(&config.conflict);
        conflicts.restore(&graph, &entries, stored_conflicts);
        // the restored graph is authoritative for what each slot accepts
        let mut accepted: Vec<(SubjectId, String, Option<String>)> = Vec::new();
        for entity in graph.live_entities() {
            for (attr, slot) in &entity.attributes {
                accepted.push((
                    SubjectId::Entity(entity.id),
                    attr.clone(),
                    slot.value.as_ref().map(|v| v.canonical_key()),
                ));
            }
        }
        for rel in graph.snapshot(None).live_relationships() {
            for (attr, slot) in &rel.attributes {
                accepted.push((
                    SubjectId::Relationship(rel.id),
                    attr.clone(),
                    slot.value.as_ref().map(|v| v.canonical_key()),
                ));
            }
        }
        for (subject, attr, key) in accepted {
            conflicts.set_accepted(subject, &attr, key);
        }

        let mut fingerprints = HashMap::new();
        for entry in &entries {
            if let LedgerOp::MentionAttached {
                mention_id,
                fingerprint,
                ..
            } = &entry.op
            {
                fingerprints.insert(fingerprint.clone(), *mention_id);
            }
        }

        let ledger = ProvenanceLedger::from_entries(entries);
        log::info!(
            "opened graph: {} live entities, {} relationships, {} ledger entries, {} open conflicts",
            graph.entity_count(),
            graph.relationship_count(),
            ledger.len(),
            conflicts.open_count()
        );

        Ok(Self {
            analyzer: GraphAnalyzer::new(config.analyzer.cache_capacity),
            config,
            store,
            backlog: Mutex::new(WriteBacklog::default()),
            state: RwLock::new(EngineState {
                graph,
                resolver,
                conflicts,
                fingerprints,
            }),
            ledger,
            locks: LockManager::new(),
        })
    }

    /// Engine over an in-memory store, used by tests and dry runs.
    pub async fn in_memory(config: Config) -> Result<Self> {
        Self::open(config, Arc::new(MemoryStore::new())).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Consolidate a batch of mentions. Invalid mentions are rejected and
    /// counted without aborting the rest; a store failure aborts the batch
    /// at a mention boundary with the unwritten rows parked for retry.
    /// Parked rows flush before any mention is processed, so resubmitting a
    /// failed batch repairs the store even when every mention deduplicates.
    pub async fn submit_batch(&self, mentions: Vec<Mention>) -> Result<BatchReport> {
        self.flush_backlog().await?;
        let mut report = BatchReport {
            mentions: mentions.len(),
            ..Default::default()
        };
        for (idx, mention) in mentions.into_iter().enumerate() {
            if let Err(err) = mention.validate() {
                log::warn!("rejecting mention {} of batch: {}", idx, err);
                report.rejected += 1;
                continue;
            }
            match self.process_mention(mention).await? {
                MentionOutcome::Duplicate => report.duplicates += 1,
                MentionOutcome::Applied(counters) => {
                    report.accepted += 1;
                    report.absorb(counters);
                }
            }
        }
        log::info!(
            "batch consolidated: {} accepted ({} disputed), {} duplicates, {} rejected, {} created, {} merges, {} conflicts opened",
            report.accepted,
            report.disputed,
            report.duplicates,
            report.rejected,
            report.entities_created,
            report.merges,
            report.conflicts_opened
        );
        Ok(report)
    }

    async fn process_mention(&self, mention: Mention) -> Result<MentionOutcome> {
        match mention.kind.clone() {
            MentionKind::Entity { entity_type, value } => {
                self.process_entity_mention(mention, entity_type, value).await
            }
            MentionKind::Relationship {
                rel_type,
                source,
                target,
            } => {
                self.process_relationship_mention(mention, rel_type, source, target)
                    .await
            }
        }
    }

    async fn process_entity_mention(
        &self,
        mention: Mention,
        entity_type: String,
        value: String,
    ) -> Result<MentionOutcome> {
        let keys = {
            let state = self.state.read().await;
            state.resolver.block_keys(&entity_type, &value)
        };
        let _blocks = self.locks.lock_blocks(&keys).await;

        let fingerprint = mention.fingerprint();
        let decision = {
            let state = self.state.read().await;
            if state.fingerprints.contains_key(&fingerprint) {
                log::debug!("mention {} already consolidated, skipping", mention.id);
                return Ok(MentionOutcome::Duplicate);
            }
            state
                .resolver
                .resolve(&entity_type, &value, &mention.attributes, &state.graph)
        };
        let _entities = self.locks.lock_entities(&decision_targets(&decision)).await;

        let outcome = {
            let mut state = self.state.write().await;
            self.apply_entity_decision(
                &mut state,
                &mention,
                &entity_type,
                &value,
                decision,
                &fingerprint,
            )?
        };
        self.persist(&outcome).await?;
        Ok(MentionOutcome::Applied(outcome.counters))
    }

    async fn process_relationship_mention(
        &self,
        mention: Mention,
        rel_type: String,
        source: EntityRef,
        target: EntityRef,
    ) -> Result<MentionOutcome> {
        // one sorted lock set covers both endpoints' blocks
        let keys = {
            let state = self.state.read().await;
            let mut keys = state
                .resolver
                .block_keys(&source.entity_type, &source.value);
            keys.extend(state.resolver.block_keys(&target.entity_type, &target.value));
            keys
        };
        let _blocks = self.locks.lock_blocks(&keys).await;

        let fingerprint = mention.fingerprint();
        let (source_decision, target_decision) = {
            let state = self.state.read().await;
            if state.fingerprints.contains_key(&fingerprint) {
                log::debug!("mention {} already consolidated, skipping", mention.id);
                return Ok(MentionOutcome::Duplicate);
            }
            let empty = std::collections::BTreeMap::new();
            (
                state
                    .resolver
                    .resolve(&source.entity_type, &source.value, &empty, &state.graph),
                state
                    .resolver
                    .resolve(&target.entity_type, &target.value, &empty, &state.graph),
            )
        };
        let mut targets = decision_targets(&source_decision);
        targets.extend(decision_targets(&target_decision));
        let _entities = self.locks.lock_entities(&targets).await;

        let outcome = {
            let mut state = self.state.write().await;
            self.apply_relationship_mention(
                &mut state,
                &mention,
                &rel_type,
                &source,
                source_decision,
                &target,
                target_decision,
                &fingerprint,
            )?
        };
        self.persist(&outcome).await?;
        Ok(MentionOutcome::Applied(outcome.counters))
    }

    fn apply_entity_decision(
        &self,
        state: &mut EngineState,
        mention: &Mention,
        entity_type: &str,
        value: &str,
        decision: ResolutionDecision,
        fingerprint: &str,
    ) -> Result<ApplyOutcome> {
        let mut out = ApplyOutcome::default();
        let EngineState {
            graph,
            resolver,
            conflicts,
            fingerprints,
        } = state;

        let (target, tentative) = match revalidate(graph, decision) {
            ResolutionDecision::CreateNew => {
                let id = Uuid::new_v4();
                let entry = self.ledger.append(Assertion::new(
                    SubjectId::Entity(id),
                    mention.source_id.as_str(),
                    mention.confidence,
                    mention.extraction_method.as_str(),
                    LedgerOp::EntityCreated {
                        entity_type: entity_type.to_string(),
                        value: value.to_string(),
                    },
                ));
                graph.create_entity_with_id(id, entity_type, value, mention.confidence, entry.seq);
                out.entries.push(entry);
                out.counters.entities_created += 1;
                log::debug!("created entity {} ({} '{}')", id, entity_type, value);
                (id, false)
            }
            ResolutionDecision::Attach {
                entity_id,
                score,
                tentative,
            } => {
                log::debug!(
                    "attaching '{}' to {} (score {:.3}{})",
                    value,
                    entity_id,
                    score,
                    if tentative { ", tentative" } else { "" }
                );
                if tentative {
                    out.counters.tentative += 1;
                }
                (entity_id, tentative)
            }
            ResolutionDecision::Merge { group, score } => {
                let winner = group[0];
                let losers = group[1..].to_vec();
                log::debug!(
                    "'{}' bridges {} entities (score {:.3}), merging into {}",
                    value,
                    group.len(),
                    score,
                    winner
                );
                self.execute_merge(graph, conflicts, &mut out, mention, winner, losers)?;
                (winner, false)
            }
        };

        let subject = SubjectId::Entity(target);
        let entry = self.ledger.append(Assertion::new(
            subject,
            mention.source_id.as_str(),
            mention.confidence,
            mention.extraction_method.as_str(),
            LedgerOp::MentionAttached {
                mention_id: mention.id,
                fingerprint: fingerprint.to_string(),
                tentative,
                surface: Some(value.to_string()),
            },
        ));
        graph.attach_mention(subject, mention.id, tentative)?;
        out.entries.push(entry);
        fingerprints.insert(fingerprint.to_string(), mention.id);

        // tentative attachments contribute membership only; their surface
        // form and attributes wait until the link is confirmed
        if !tentative {
            graph.observe_surface_form(target, value, mention.confidence)?;
            resolver.index_entity(target, entity_type, value);
            self.assert_attributes(graph, conflicts, &mut out, subject, mention)?;
        }

        out.entity_ids.insert(target);
        out.finish(graph, conflicts);
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_relationship_mention(
        &self,
        state: &mut EngineState,
        mention: &Mention,
        rel_type: &str,
        source_ref: &EntityRef,
        source_decision: ResolutionDecision,
        target_ref: &EntityRef,
        target_decision: ResolutionDecision,
        fingerprint: &str,
    ) -> Result<ApplyOutcome> {
        let mut out = ApplyOutcome::default();
        let EngineState {
            graph,
            resolver,
            conflicts,
            fingerprints,
        } = state;

        let source_id = self.resolve_endpoint(
            graph,
            resolver,
            conflicts,
            &mut out,
            mention,
            source_ref,
            source_decision,
        )?;
        let target_id = self.resolve_endpoint(
            graph,
            resolver,
            conflicts,
            &mut out,
            mention,
            target_ref,
            target_decision,
        )?;

        let rel_id = match graph.find_relationship(source_id, rel_type, target_id) {
            Some(existing) => {
                let entry = self.ledger.append(Assertion::new(
                    SubjectId::Relationship(existing),
                    mention.source_id.as_str(),
                    mention.confidence,
                    mention.extraction_method.as_str(),
                    LedgerOp::MentionAttached {
                        mention_id: mention.id,
                        fingerprint: fingerprint.to_string(),
                        tentative: false,
                        surface: None,
                    },
                ));
                graph.boost_relationship_confidence(existing, mention.confidence)?;
                graph.attach_mention(SubjectId::Relationship(existing), mention.id, false)?;
                out.entries.push(entry);
                existing
            }
            None => {
                let id = Uuid::new_v4();
                let entry = self.ledger.append(Assertion::new(
                    SubjectId::Relationship(id),
                    mention.source_id.as_str(),
                    mention.confidence,
                    mention.extraction_method.as_str(),
                    LedgerOp::RelationshipCreated {
                        rel_type: rel_type.to_string(),
                        source: source_id,
                        target: target_id,
                    },
                ));
                graph.upsert_relationship_with_id(
                    id,
                    rel_type,
                    source_id,
                    target_id,
                    mention.confidence,
                    entry.seq,
                )?;
                out.entries.push(entry);
                out.counters.relationships_created += 1;

                let attach = self.ledger.append(Assertion::new(
                    SubjectId::Relationship(id),
                    mention.source_id.as_str(),
                    mention.confidence,
                    mention.extraction_method.as_str(),
                    LedgerOp::MentionAttached {
                        mention_id: mention.id,
                        fingerprint: fingerprint.to_string(),
                        tentative: false,
                        surface: None,
                    },
                ));
                graph.attach_mention(SubjectId::Relationship(id), mention.id, false)?;
                out.entries.push(attach);
                log::debug!(
                    "created relationship {} ({} --{}-> {})",
                    id,
                    source_id,
                    rel_type,
                    target_id
                );
                id
            }
        };
        fingerprints.insert(fingerprint.to_string(), mention.id);

        let subject = SubjectId::Relationship(rel_id);
        self.assert_attributes(graph, conflicts, &mut out, subject, mention)?;
        out.relationship_ids.insert(rel_id);
        out.finish(graph, conflicts);
        Ok(out)
    }

    /// Resolve a relationship endpoint to a live entity id, creating the
    /// entity with this mention's provenance when nothing matches. An
    /// existing match is a lookup, not an observation: the endpoint value
    /// contributes no surface evidence, and an ambiguous endpoint simply
    /// uses the best candidate.
    fn resolve_endpoint(
        &self,
        graph: &mut CanonicalGraph,
        resolver: &mut EntityResolver,
        conflicts: &mut ConflictBook,
        out: &mut ApplyOutcome,
        mention: &Mention,
        endpoint: &EntityRef,
        decision: ResolutionDecision,
    ) -> Result<EntityId> {
        match revalidate(graph, decision) {
            ResolutionDecision::CreateNew => {
                let id = Uuid::new_v4();
                let entry = self.ledger.append(Assertion::new(
                    SubjectId::Entity(id),
                    mention.source_id.as_str(),
                    mention.confidence,
                    mention.extraction_method.as_str(),
                    LedgerOp::EntityCreated {
                        entity_type: endpoint.entity_type.clone(),
                        value: endpoint.value.clone(),
                    },
                ));
                graph.create_entity_with_id(
                    id,
                    &endpoint.entity_type,
                    &endpoint.value,
                    mention.confidence,
                    entry.seq,
                );
                resolver.index_entity(id, &endpoint.entity_type, &endpoint.value);
                out.entries.push(entry);
                out.entity_ids.insert(id);
                out.counters.entities_created += 1;
                Ok(id)
            }
            ResolutionDecision::Attach { entity_id, .. } => Ok(entity_id),
            ResolutionDecision::Merge { group, .. } => {
                let winner = group[0];
                let losers = group[1..].to_vec();
                self.execute_merge(graph, conflicts, out, mention, winner, losers)?;
                Ok(winner)
            }
        }
    }

    /// Log, retarget, and apply a merge of `losers` into `winner`.
    fn execute_merge(
        &self,
        graph: &mut CanonicalGraph,
        conflicts: &mut ConflictBook,
        out: &mut ApplyOutcome,
        mention: &Mention,
        winner: EntityId,
        losers: Vec<EntityId>,
    ) -> Result<()> {
        let entry = self.ledger.append(Assertion::new(
            SubjectId::Entity(winner),
            mention.source_id.as_str(),
            mention.confidence,
            mention.extraction_method.as_str(),
            LedgerOp::Merged {
                absorbed: losers.clone(),
            },
        ));
        out.entries.push(entry);

        let loser_subjects: Vec<SubjectId> =
            losers.iter().copied().map(SubjectId::Entity).collect();
        for record in conflicts.retarget(SubjectId::Entity(winner), &loser_subjects) {
            out.conflict_ids.insert(record.id);
        }

        let merge = graph.apply_merge(winner, &losers)?;
        for id in merge.rewritten_relationships {
            out.relationship_ids.insert(id);
        }
        for (dropped, kept) in &merge.folded_relationships {
            out.relationship_ids.insert(*dropped);
            out.relationship_ids.insert(*kept);
            for record in conflicts.retarget(
                SubjectId::Relationship(*kept),
                &[SubjectId::Relationship(*dropped)],
            ) {
                out.conflict_ids.insert(record.id);
            }
        }
        // the fold may have pulled loser values into empty winner slots
        mirror_accepted(graph, conflicts, SubjectId::Entity(winner));
        for (_, kept) in &merge.folded_relationships {
            mirror_accepted(graph, conflicts, SubjectId::Relationship(*kept));
        }
        out.entity_ids.insert(winner);
        out.entity_ids.extend(losers.iter().copied());
        out.counters.merges += 1;
        log::info!("merged {} entities into {}", losers.len() + 1, winner);
        Ok(())
    }

    /// Ledger and evaluate each attribute of a firm mention.
    fn assert_attributes(
        &self,
        graph: &mut CanonicalGraph,
        conflicts: &mut ConflictBook,
        out: &mut ApplyOutcome,
        subject: SubjectId,
        mention: &Mention,
    ) -> Result<()> {
        let mut landed_disputed = false;
        for (attr, value) in &mention.attributes {
            let entry = self.ledger.append(Assertion::new(
                subject,
                mention.source_id.as_str(),
                mention.confidence,
                mention.extraction_method.as_str(),
                LedgerOp::AttributeAsserted {
                    attribute: attr.clone(),
                    value: value.clone(),
                },
            ));
            let eval = conflicts.evaluate(
                subject,
                attr,
                value.clone(),
                mention.confidence,
                &mention.source_id,
                entry.assertion_id,
            );
            match &eval {
                Evaluation::Accepted {
                    resolved_conflict,
                    record,
                    ..
                } => {
                    if let Some(id) = resolved_conflict {
                        out.conflict_ids.insert(*id);
                        out.counters.conflicts_resolved += 1;
                    }
                    if let Some(id) = record {
                        out.conflict_ids.insert(*id);
                    }
                }
                Evaluation::Superseded { record, .. } => {
                    out.conflict_ids.insert(*record);
                }
                Evaluation::Disputed {
                    conflict_id,
                    opened,
                } => {
                    landed_disputed = true;
                    out.conflict_ids.insert(*conflict_id);
                    if *opened {
                        out.counters.conflicts_opened += 1;
                    }
                }
                Evaluation::Corroborated { .. } => {}
            }
            apply_evaluation(graph, subject, attr, &eval, entry.assertion_id)?;
            out.entries.push(entry);
        }
        if landed_disputed {
            out.counters.disputed += 1;
        }
        Ok(())
    }

    /// Persist one mention's outcome: ledger entries first, then the
    /// canonical records they touched. Rows from an earlier failed persist
    /// go out ahead of this outcome's; on failure everything unwritten
    /// parks in the backlog. The in-memory state already holds the outcome
    /// either way, so fingerprint dedup on a retried mention is correct and
    /// the store heals on the next successful write.
    async fn persist(&self, outcome: &ApplyOutcome) -> Result<()> {
        let mut backlog = self.backlog.lock().await;
        let result = match self.drain_backlog(&mut backlog).await {
            Ok(()) => {
                self.write_rows(
                    &outcome.entries,
                    &outcome.entities,
                    &outcome.relationships,
                    &outcome.conflicts,
                )
                .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            backlog.absorb(outcome);
            log::warn!("store write failed, {} rows parked for retry", backlog.len());
            return Err(err);
        }
        Ok(())
    }

    /// Push any rows a failed persist left behind.
    async fn flush_backlog(&self) -> Result<()> {
        let mut backlog = self.backlog.lock().await;
        self.drain_backlog(&mut backlog).await
    }

    /// Write every parked row, oldest first. The backlog clears only once
    /// all of them land; partial progress is repeated on the next attempt.
    async fn drain_backlog(&self, backlog: &mut WriteBacklog) -> Result<()> {
        if backlog.is_empty() {
            return Ok(());
        }
        self.write_rows(
            &backlog.entries,
            &backlog.entities,
            &backlog.relationships,
            &backlog.conflicts,
        )
        .await?;
        log::info!("store caught up, {} backlogged rows written", backlog.len());
        *backlog = WriteBacklog::default();
        Ok(())
    }

    async fn write_rows(
        &self,
        entries: &[LedgerEntry],
        entities: &[CanonicalEntity],
        relationships: &[CanonicalRelationship],
        conflicts: &[ConflictRecord],
    ) -> Result<()> {
        for entry in entries {
            self.store.append_ledger(entry).await?;
        }
        for entity in entities {
            self.store.save_entity(entity).await?;
        }
        for rel in relationships {
            self.store.save_relationship(rel).await?;
        }
        for record in conflicts {
            self.store.save_conflict(record).await?;
        }
        Ok(())
    }

    /// Snapshot of the canonical graph; `since_revision` returns only
    /// subjects whose revision is strictly greater, tombstones included.
    pub async fn snapshot(&self, since_revision: Option<u64>) -> GraphSnapshot {
        self.state.read().await.graph.snapshot(since_revision)
    }

    /// Canonical entity by id, following merge redirects.
    pub async fn entity(&self, id: EntityId) -> Option<CanonicalEntity> {
        self.state.read().await.graph.entity(id).cloned()
    }

    /// Relationships within `depth` hops of an entity.
    pub async fn neighborhood(&self, id: EntityId, depth: usize) -> Vec<CanonicalRelationship> {
        self.state.read().await.graph.neighborhood(id, depth)
    }

    pub async fn conflicts(&self, filter: &ConflictFilter) -> Vec<ConflictRecord> {
        self.state.read().await.conflicts.list(filter)
    }

    pub async fn conflict(&self, id: ConflictId) -> Option<ConflictRecord> {
        self.state.read().await.conflicts.get(id).cloned()
    }

    /// Manually settle a dispute on one of its competing values. Recorded in
    /// the ledger as an operator assertion so replay reaches the same state.
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        chosen: AttrValue,
        note: Option<String>,
    ) -> Result<ConflictRecord> {
        let (record, outcome) = {
            let mut state = self.state.write().await;
            let EngineState {
                graph, conflicts, ..
            } = &mut *state;
            let record = conflicts.resolve_manual(conflict_id, &chosen, note)?;
            // a ruling that changes the slot corrects whatever assertion
            // established the standing value
            let corrected = graph
                .slot(record.subject, &record.attribute)
                .filter(|slot| {
                    slot.value.as_ref().map(|v| v.canonical_key()) != Some(chosen.canonical_key())
                })
                .and_then(|slot| slot.provenance.first().copied());
            let mut assertion = Assertion::new(
                record.subject,
                OPERATOR_SOURCE,
                1.0,
                MANUAL_METHOD,
                LedgerOp::AttributeAsserted {
                    attribute: record.attribute.clone(),
                    value: chosen.clone(),
                },
            );
            if let Some(prior) = corrected {
                assertion = assertion.superseding(prior);
            }
            let entry = self.ledger.append(assertion);
            conflicts.record_manual(
                record.subject,
                &record.attribute,
                chosen.clone(),
                1.0,
                OPERATOR_SOURCE,
                entry.assertion_id,
            );
            graph.accept_attribute(record.subject, &record.attribute, chosen, entry.assertion_id)?;

            let mut out = ApplyOutcome::default();
            out.entries.push(entry);
            out.conflict_ids.insert(conflict_id);
            match record.subject {
                SubjectId::Entity(id) => {
                    out.entity_ids.insert(id);
                }
                SubjectId::Relationship(id) => {
                    out.relationship_ids.insert(id);
                }
            }
            out.finish(graph, conflicts);
            (record, out)
        };
        self.persist(&outcome).await?;
        log::info!("conflict {} resolved by operator", conflict_id);
        Ok(record)
    }

    /// Reopen a resolved conflict. The resolved record stays; a new disputed
    /// record linked through `reopened_from` takes over the slot.
    pub async fn reopen_conflict(&self, conflict_id: ConflictId) -> Result<ConflictRecord> {
        let (record, outcome) = {
            let mut state = self.state.write().await;
            let EngineState {
                graph, conflicts, ..
            } = &mut *state;
            let record = conflicts.reopen(conflict_id)?;
            let entry = self.ledger.append(Assertion::new(
                record.subject,
                OPERATOR_SOURCE,
                1.0,
                MANUAL_METHOD,
                LedgerOp::ConflictReopened {
                    conflict_id,
                    attribute: record.attribute.clone(),
                },
            ));
            graph.dispute_attribute(record.subject, &record.attribute)?;

            let mut out = ApplyOutcome::default();
            out.entries.push(entry);
            out.conflict_ids.insert(conflict_id);
            out.conflict_ids.insert(record.id);
            match record.subject {
                SubjectId::Entity(id) => {
                    out.entity_ids.insert(id);
                }
                SubjectId::Relationship(id) => {
                    out.relationship_ids.insert(id);
                }
            }
            out.finish(graph, conflicts);
            (record, out)
        };
        self.persist(&outcome).await?;
        log::info!("conflict {} reopened by operator", conflict_id);
        Ok(record)
    }

    /// Full assertion history for a subject. The history of every absorbed
    /// entity or folded edge is included, ordered by `(timestamp, seq)`.
    pub async fn trace(&self, subject: SubjectId) -> Vec<LedgerEntry> {
        let subjects = match subject {
            SubjectId::Entity(id) => {
                let state = self.state.read().await;
                let ids = state.graph.absorbed_ids(id);
                if ids.is_empty() {
                    vec![SubjectId::Entity(id)]
                } else {
                    ids.into_iter().map(SubjectId::Entity).collect()
                }
            }
            SubjectId::Relationship(id) => {
                let state = self.state.read().await;
                let ids = state.graph.absorbed_relationship_ids(id);
                if ids.is_empty() {
                    vec![SubjectId::Relationship(id)]
                } else {
                    ids.into_iter().map(SubjectId::Relationship).collect()
                }
            }
        };
        self.ledger.entries_for(&subjects)
    }

    /// Centrality ranking over the live graph, served from cache when the
    /// revision has not moved. The adjacency view is copied out of a short
    /// read guard so writers never wait behind a long measure.
    pub async fn centrality(&self, measure: Measure) -> Arc<CentralityRanking> {
        let (revision, adjacency) = {
            let state = self.state.read().await;
            (state.graph.revision(), state.graph.adjacency())
        };
        self.analyzer.ranking(revision, &adjacency, measure)
    }

    /// Rebuild state from the ledger alone and compare it to the live
    /// graph. An inconsistent report indicates corruption or a logic bug.
    pub async fn verify_replay(&self) -> Result<ReplayReport> {
        let state = self.state.read().await;
        let entries = self.ledger.all_entries();
        let replayed = replay::replay(&self.config, &entries)?;
        Ok(replay::verify(&state.graph, &replayed.graph))
    }

    pub async fn stats(&self) -> EngineStats {
        let state = self.state.read().await;
        EngineStats {
            live_entities: state.graph.entity_count(),
            tombstones: state.graph.tombstone_count(),
            relationships: state.graph.relationship_count(),
            ledger_entries: self.ledger.len(),
            open_conflicts: state.conflicts.open_count(),
            total_conflicts: state.conflicts.all_records().len(),
            revision: state.graph.revision(),
            blocks: state.resolver.index().block_count(),
            block_postings: state.resolver.index().posting_count(),
            max_block_size: state.resolver.index().max_block_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictStatus, ResolutionMethod};
    use crate::error::GraphweldError;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn engine() -> ConsolidationEngine {
        ConsolidationEngine::in_memory(Config::default())
            .await
            .unwrap()
    }

    fn org(value: &str, source: &str, confidence: f64) -> Mention {
        Mention::entity("ORG", value, source, confidence).with_method("ner-v1")
    }

    #[tokio::test]
    async fn test_batch_creates_then_attaches_alias() {
        let engine = engine().await;
        let report = engine
            .submit_batch(vec![
                org("apple co", "src-a", 0.9),
                org("apple company", "src-b", 0.85),
            ])
            .await
            .unwrap();
        assert_eq!(report.accepted, 2);
        assert_eq!(report.entities_created, 1);

        let snap = engine.snapshot(None).await;
        let live: Vec<_> = snap.live_entities().collect();
        assert_eq!(live.len(), 1);
        // lower-confidence observation becomes an alias, not the value
        assert_eq!(live[0].value, "apple co");
        assert!(live[0].aliases.contains("apple company"));
        assert_eq!(live[0].mention_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_resubmitted_mention_is_deduplicated() {
        let engine = engine().await;
        let mention = org("apple", "src-a", 0.9);
        engine.submit_batch(vec![mention.clone()]).await.unwrap();
        let before = engine.stats().await.ledger_entries;

        let report = engine.submit_batch(vec![mention]).await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.accepted, 0);
        assert_eq!(engine.stats().await.ledger_entries, before);
    }

    #[tokio::test]
    async fn test_invalid_mention_rejected_without_aborting_batch() {
        let engine = engine().await;
        let report = engine
            .submit_batch(vec![org("   ", "src-a", 0.9), org("apple", "src-a", 0.9)])
            .await
            .unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.accepted, 1);
        assert_eq!(engine.stats().await.live_entities, 1);
    }

    #[tokio::test]
    async fn test_bridging_mention_merges_into_oldest() {
        let engine = engine().await;
        engine
            .submit_batch(vec![
                org("apple co", "src-a", 0.9)
                    .with_attribute("founded_year", AttrValue::Number(1976.0)),
            ])
            .await
            .unwrap();
        // contradicting attribute drags the composite below the ambiguous
        // band, so this becomes a second entity rather than an attach
        engine
            .submit_batch(vec![
                org("apple inc", "src-b", 0.9)
                    .with_attribute("founded_year", AttrValue::Number(1998.0)),
            ])
            .await
            .unwrap();
        let snap = engine.snapshot(None).await;
        assert_eq!(snap.live_entities().count(), 2);
        let id_a = snap
            .live_entities()
            .find(|e| e.value == "apple co")
            .unwrap()
            .id;
        let id_b = snap
            .live_entities()
            .find(|e| e.value == "apple inc")
            .unwrap()
            .id;

        // "apple" scores above the merge threshold against both
        let report = engine
            .submit_batch(vec![org("apple", "src-c", 0.95)])
            .await
            .unwrap();
        assert_eq!(report.merges, 1);

        let survivor = engine.entity(id_b).await.unwrap();
        assert_eq!(survivor.id, id_a);
        assert_eq!(survivor.value, "apple");
        assert!(survivor.aliases.contains("apple co"));
        assert!(survivor.aliases.contains("apple inc"));
        // winner-preferred fold keeps the survivor's attribute
        let slot = survivor.attributes.get("founded_year").unwrap();
        assert_eq!(slot.value, Some(AttrValue::Number(1976.0)));

        // absorbed history folds into the survivor's trace
        let entries = engine.trace(SubjectId::Entity(id_a)).await;
        assert!(entries
            .iter()
            .any(|e| e.subject == SubjectId::Entity(id_b)));
        assert!(entries
            .iter()
            .any(|e| matches!(e.op, LedgerOp::Merged { .. })));
    }

    #[tokio::test]
    async fn test_relationship_mentions_create_endpoints_and_fold() {
        let engine = engine().await;
        let report = engine
            .submit_batch(vec![
                Mention::relationship(
                    "founded_by",
                    EntityRef::new("ORG", "apple"),
                    EntityRef::new("PERSON", "steve jobs"),
                    "src-a",
                    0.8,
                ),
                Mention::relationship(
                    "founded_by",
                    EntityRef::new("ORG", "apple"),
                    EntityRef::new("PERSON", "steve jobs"),
                    "src-b",
                    0.95,
                ),
            ])
            .await
            .unwrap();
        assert_eq!(report.entities_created, 2);
        assert_eq!(report.relationships_created, 1);

        let snap = engine.snapshot(None).await;
        assert_eq!(snap.relationships.len(), 1);
        let rel = &snap.relationships[0];
        assert_eq!(rel.mention_ids.len(), 2);
        assert!((rel.confidence - 0.95).abs() < 1e-9);

        // creation plus two attachments
        let entries = engine.trace(SubjectId::Relationship(rel.id)).await;
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn test_entity_merge_folds_parallel_edges() {
        let engine = engine().await;
        // contradicting attributes keep the near-duplicates separate
        engine
            .submit_batch(vec![
                org("apple", "src-a", 0.9)
                    .with_attribute("founded_year", AttrValue::Number(1976.0)),
            ])
            .await
            .unwrap();
        engine
            .submit_batch(vec![
                org("apple incorporated", "src-b", 0.9)
                    .with_attribute("founded_year", AttrValue::Number(1998.0)),
            ])
            .await
            .unwrap();
        // one edge from each duplicate to the same person; the exact-name
        // endpoints attach without bridging
        engine
            .submit_batch(vec![
                Mention::relationship(
                    "founded_by",
                    EntityRef::new("ORG", "apple"),
                    EntityRef::new("PERSON", "steve jobs"),
                    "src-a",
                    0.8,
                ),
                Mention::relationship(
                    "founded_by",
                    EntityRef::new("ORG", "apple incorporated"),
                    EntityRef::new("PERSON", "steve jobs"),
                    "src-b",
                    0.9,
                ),
            ])
            .await
            .unwrap();
        assert_eq!(engine.stats().await.relationships, 2);

        // "apple inc" bridges both orgs; the merge makes the edges identical
        let report = engine
            .submit_batch(vec![org("apple inc", "src-c", 0.95)])
            .await
            .unwrap();
        assert_eq!(report.merges, 1);

        let snap = engine.snapshot(None).await;
        assert_eq!(snap.live_relationships().count(), 1);
        assert_eq!(snap.relationships.len(), 2);
        let live = snap.live_relationships().next().unwrap();
        let tomb = snap.relationships.iter().find(|r| r.id != live.id).unwrap();
        assert_eq!(tomb.merged_into, Some(live.id));
        assert!(tomb.mention_ids.is_empty());
        // the fold carried the mention and the higher confidence over
        assert_eq!(live.mention_ids.len(), 2);
        assert!((live.confidence - 0.9).abs() < 1e-9);

        // the folded edge's history stays reachable through its old id
        let entries = engine.trace(SubjectId::Relationship(tomb.id)).await;
        assert_eq!(entries.len(), 4);
        assert!(entries
            .iter()
            .any(|e| e.subject == SubjectId::Relationship(tomb.id)));
        assert!(entries
            .iter()
            .any(|e| e.subject == SubjectId::Relationship(live.id)));

        let report = engine.verify_replay().await.unwrap();
        assert!(report.is_consistent(), "{:?}", report.mismatches);
    }

    #[tokio::test]
    async fn test_endpoint_reference_is_lookup_not_evidence() {
        let engine = engine().await;
        engine
            .submit_batch(vec![org("apple co", "src-a", 0.9)])
            .await
            .unwrap();
        let report = engine
            .submit_batch(vec![Mention::relationship(
                "founded_by",
                EntityRef::new("ORG", "apple company"),
                EntityRef::new("PERSON", "steve jobs"),
                "src-b",
                0.95,
            )])
            .await
            .unwrap();
        // only the person is new; the org endpoint binds to "apple co"
        assert_eq!(report.entities_created, 1);

        let snap = engine.snapshot(None).await;
        let company = snap
            .live_entities()
            .find(|e| e.entity_type == "ORG")
            .unwrap();
        assert_eq!(company.value, "apple co");
        // the endpoint's own surface form leaves no trace on the entity
        assert!(company.aliases.is_empty());
        assert_eq!(company.mention_ids.len(), 1);
        assert_eq!(snap.relationships[0].source, company.id);

        let report = engine.verify_replay().await.unwrap();
        assert!(report.is_consistent(), "{:?}", report.mismatches);
    }

    #[tokio::test]
    async fn test_displacing_folded_value_after_merge_leaves_record() {
        let engine = engine().await;
        engine
            .submit_batch(vec![
                org("apple co", "src-a", 0.9)
                    .with_attribute("founded_year", AttrValue::Number(1976.0)),
            ])
            .await
            .unwrap();
        // contradicting founded_year keeps this a second entity; it brings
        // the only hq value on file
        engine
            .submit_batch(vec![org("apple incorporated", "src-b", 0.7)
                .with_attribute("founded_year", AttrValue::Number(1998.0))
                .with_attribute("hq", AttrValue::Text("austin".into()))])
            .await
            .unwrap();
        let snap = engine.snapshot(None).await;
        let id_a = snap
            .live_entities()
            .find(|e| e.value == "apple co")
            .unwrap()
            .id;

        let report = engine
            .submit_batch(vec![org("apple inc", "src-c", 0.95)])
            .await
            .unwrap();
        assert_eq!(report.merges, 1);
        // the fold pulled hq=austin into the survivor's empty slot, and no
        // disagreement has been evaluated yet
        let survivor = engine.entity(id_a).await.unwrap();
        assert_eq!(
            survivor.attributes.get("hq").unwrap().value,
            Some(AttrValue::Text("austin".into()))
        );
        assert!(engine.conflicts(&ConflictFilter::default()).await.is_empty());

        // stronger evidence displaces the folded value; the episode must
        // leave a resolved record exactly as it would without the merge
        engine
            .submit_batch(vec![org("apple inc", "src-d", 0.9)
                .with_attribute("founded_year", AttrValue::Number(1976.0))
                .with_attribute("hq", AttrValue::Text("berlin".into()))])
            .await
            .unwrap();
        let survivor = engine.entity(id_a).await.unwrap();
        let slot = survivor.attributes.get("hq").unwrap();
        assert_eq!(slot.value, Some(AttrValue::Text("berlin".into())));
        assert!(!slot.disputed);

        let records = engine.conflicts(&ConflictFilter::default()).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].subject, SubjectId::Entity(id_a));
        assert_eq!(records[0].attribute, "hq");
        assert_eq!(records[0].status, ConflictStatus::Resolved);
        assert_eq!(records[0].accepted_key.as_deref(), Some("s:berlin"));
        assert_eq!(records[0].resolution_method, Some(ResolutionMethod::Margin));
        assert_eq!(records[0].competing.len(), 2);

        let report = engine.verify_replay().await.unwrap();
        assert!(report.is_consistent(), "{:?}", report.mismatches);
    }

    #[tokio::test]
    async fn test_confidence_margin_supersedes_weaker_value() {
        let engine = engine().await;
        engine
            .submit_batch(vec![org("apple", "src-a", 0.9)
                .with_attribute("founded_year", AttrValue::Number(1976.0))
                .with_attribute("hq", AttrValue::Text("cupertino".into()))])
            .await
            .unwrap();
        let report = engine
            .submit_batch(vec![org("apple", "src-b", 0.7)
                .with_attribute("founded_year", AttrValue::Number(1977.0))
                .with_attribute("hq", AttrValue::Text("cupertino".into()))])
            .await
            .unwrap();
        assert_eq!(report.conflicts_opened, 0);
        assert_eq!(report.disputed, 0);

        let snap = engine.snapshot(None).await;
        let entity = snap.live_entities().next().unwrap();
        let slot = entity.attributes.get("founded_year").unwrap();
        assert_eq!(slot.value, Some(AttrValue::Number(1976.0)));
        assert!(!slot.disputed);

        // the outvoted 1977 never blocked the slot but is still on file,
        // resolved, with both values retained
        let records = engine.conflicts(&ConflictFilter::default()).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ConflictStatus::Resolved);
        assert_eq!(records[0].accepted_key.as_deref(), Some("n:1976"));
        assert_eq!(records[0].resolution_method, Some(ResolutionMethod::Margin));
        assert_eq!(records[0].competing.len(), 2);
    }

    #[tokio::test]
    async fn test_tied_values_dispute_then_corroboration_settles() {
        let engine = engine().await;
        engine
            .submit_batch(vec![org("apple", "src-a", 0.9)
                .with_attribute("founded_year", AttrValue::Number(1976.0))
                .with_attribute("hq", AttrValue::Text("cupertino".into()))])
            .await
            .unwrap();
        let report = engine
            .submit_batch(vec![org("apple", "src-b", 0.9)
                .with_attribute("founded_year", AttrValue::Number(1977.0))
                .with_attribute("hq", AttrValue::Text("cupertino".into()))])
            .await
            .unwrap();
        assert_eq!(report.conflicts_opened, 1);
        assert_eq!(report.disputed, 1);

        let snap = engine.snapshot(None).await;
        let entity = snap.live_entities().next().unwrap();
        let slot = entity.attributes.get("founded_year").unwrap();
        // last accepted value stays visible while disputed
        assert_eq!(slot.value, Some(AttrValue::Number(1976.0)));
        assert!(slot.disputed);

        // a third source makes 1976 strictly better corroborated
        let report = engine
            .submit_batch(vec![org("apple", "src-c", 0.9)
                .with_attribute("founded_year", AttrValue::Number(1976.0))
                .with_attribute("hq", AttrValue::Text("cupertino".into()))])
            .await
            .unwrap();
        assert_eq!(report.conflicts_resolved, 1);

        let snap = engine.snapshot(None).await;
        let entity = snap.live_entities().next().unwrap();
        let slot = entity.attributes.get("founded_year").unwrap();
        assert_eq!(slot.value, Some(AttrValue::Number(1976.0)));
        assert!(!slot.disputed);

        let records = engine.conflicts(&ConflictFilter::default()).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ConflictStatus::Resolved);
        assert_eq!(records[0].accepted_key.as_deref(), Some("n:1976"));
    }

    #[tokio::test]
    async fn test_manual_resolution_and_reopen() {
        let engine = engine().await;
        engine
            .submit_batch(vec![org("apple", "src-a", 0.9)
                .with_attribute("founded_year", AttrValue::Number(1976.0))
                .with_attribute("hq", AttrValue::Text("cupertino".into()))])
            .await
            .unwrap();
        engine
            .submit_batch(vec![org("apple", "src-b", 0.9)
                .with_attribute("founded_year", AttrValue::Number(1977.0))
                .with_attribute("hq", AttrValue::Text("cupertino".into()))])
            .await
            .unwrap();
        let open = engine
            .conflicts(&ConflictFilter {
                status: Some(ConflictStatus::Disputed),
                ..Default::default()
            })
            .await;
        assert_eq!(open.len(), 1);
        let conflict_id = open[0].id;

        // a value outside the competing set is refused
        let err = engine
            .resolve_conflict(conflict_id, AttrValue::Number(2001.0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphweldError::Validation(_)));

        let record = engine
            .resolve_conflict(
                conflict_id,
                AttrValue::Number(1977.0),
                Some("company registry".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(record.status, ConflictStatus::Resolved);
        assert_eq!(record.accepted_key.as_deref(), Some("n:1977"));

        let snap = engine.snapshot(None).await;
        let entity = snap.live_entities().next().unwrap();
        let slot = entity.attributes.get("founded_year").unwrap();
        assert_eq!(slot.value, Some(AttrValue::Number(1977.0)));
        assert!(!slot.disputed);

        // the operator's entry names the assertion it overrode
        let entries = engine.trace(SubjectId::Entity(entity.id)).await;
        let established = entries
            .iter()
            .find(|e| {
                matches!(&e.op, LedgerOp::AttributeAsserted { attribute, .. } if attribute == "founded_year")
            })
            .unwrap()
            .assertion_id;
        let operator_entry = entries
            .iter()
            .find(|e| e.source_id == OPERATOR_SOURCE)
            .unwrap();
        assert_eq!(operator_entry.supersedes, Some(established));

        // resolving twice is an error; reopening spawns a linked record
        assert!(engine
            .resolve_conflict(conflict_id, AttrValue::Number(1977.0), None)
            .await
            .is_err());
        let reopened = engine.reopen_conflict(conflict_id).await.unwrap();
        assert_eq!(reopened.reopened_from, Some(conflict_id));
        assert_eq!(reopened.status, ConflictStatus::Disputed);

        let snap = engine.snapshot(None).await;
        let entity = snap.live_entities().next().unwrap();
        let slot = entity.attributes.get("founded_year").unwrap();
        assert!(slot.disputed);
        assert_eq!(slot.value, Some(AttrValue::Number(1977.0)));
    }

    #[tokio::test]
    async fn test_ambiguous_mention_attaches_tentatively() {
        let engine = engine().await;
        engine
            .submit_batch(vec![org("apple co", "src-a", 0.9)])
            .await
            .unwrap();
        let report = engine
            .submit_batch(vec![org("apple computer incorporated", "src-b", 0.9)
                .with_attribute("hq", AttrValue::Text("cupertino".into()))])
            .await
            .unwrap();
        assert_eq!(report.tentative_attachments, 1);
        assert_eq!(report.entities_created, 0);

        let snap = engine.snapshot(None).await;
        let live: Vec<_> = snap.live_entities().collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].tentative_mention_ids.len(), 1);
        // a tentative link contributes membership only
        assert!(!live[0].aliases.contains("apple computer incorporated"));
        assert!(live[0].attributes.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_delta_contains_only_new_revisions() {
        let engine = engine().await;
        engine
            .submit_batch(vec![org("apple", "src-a", 0.9)])
            .await
            .unwrap();
        let rev = engine.snapshot(None).await.revision;

        engine
            .submit_batch(vec![org("orange", "src-a", 0.9)])
            .await
            .unwrap();
        let delta = engine.snapshot(Some(rev)).await;
        assert_eq!(delta.entities.len(), 1);
        assert_eq!(delta.entities[0].value, "orange");
        assert!(delta.revision > rev);
    }

    #[tokio::test]
    async fn test_centrality_over_consolidated_graph() {
        let engine = engine().await;
        engine
            .submit_batch(vec![
                Mention::relationship(
                    "supplies",
                    EntityRef::new("ORG", "alpha corp"),
                    EntityRef::new("ORG", "beta corp"),
                    "src-a",
                    0.9,
                ),
                Mention::relationship(
                    "supplies",
                    EntityRef::new("ORG", "beta corp"),
                    EntityRef::new("ORG", "gamma corp"),
                    "src-a",
                    0.9,
                ),
            ])
            .await
            .unwrap();

        let snap = engine.snapshot(None).await;
        let beta = snap
            .live_entities()
            .find(|e| e.value == "beta corp")
            .unwrap()
            .id;
        let ranking = engine.centrality(Measure::Degree).await;
        assert_eq!(ranking.len(), 3);
        assert_eq!(ranking[0].0, beta);
        assert!((ranking[0].1 - 1.0).abs() < 1e-9);

        // unchanged revision serves the cached ranking
        let again = engine.centrality(Measure::Degree).await;
        assert!(Arc::ptr_eq(&ranking, &again));
    }

    #[tokio::test]
    async fn test_concurrent_submitters_converge_on_one_entity() {
        let engine = Arc::new(engine().await);
        let mut handles = Vec::new();
        for i in 0..4 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine
                    .submit_batch(vec![org("apple", &format!("src-{}", i), 0.9)])
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = engine.stats().await;
        assert_eq!(stats.live_entities, 1);
        // one creation entry plus four attachments
        assert_eq!(stats.ledger_entries, 5);
    }

    #[tokio::test]
    async fn test_replay_matches_live_state_after_rich_history() {
        let engine = engine().await;
        engine
            .submit_batch(vec![
                org("apple co", "src-a", 0.9)
                    .with_attribute("founded_year", AttrValue::Number(1976.0))
                    .with_attribute("hq", AttrValue::Text("cupertino".into())),
                org("apple inc", "src-b", 0.9)
                    .with_attribute("founded_year", AttrValue::Number(1998.0)),
                Mention::relationship(
                    "founded_by",
                    EntityRef::new("ORG", "apple co"),
                    EntityRef::new("PERSON", "steve jobs"),
                    "src-a",
                    0.85,
                ),
                org("apple", "src-c", 0.95),
            ])
            .await
            .unwrap();
        let report = engine
            .submit_batch(vec![org("apple", "src-d", 0.9)
                .with_attribute("founded_year", AttrValue::Number(1977.0))
                .with_attribute("hq", AttrValue::Text("cupertino".into()))])
            .await
            .unwrap();
        assert_eq!(report.conflicts_opened, 1);

        let open = engine
            .conflicts(&ConflictFilter {
                status: Some(ConflictStatus::Disputed),
                ..Default::default()
            })
            .await;
        let record = open.first().expect("dispute should be open");
        engine
            .resolve_conflict(record.id, AttrValue::Number(1977.0), None)
            .await
            .unwrap();
        engine.reopen_conflict(record.id).await.unwrap();

        // corroboration settles the reopened dispute
        engine
            .submit_batch(vec![org("apple", "src-e", 0.9)
                .with_attribute("founded_year", AttrValue::Number(1977.0))])
            .await
            .unwrap();

        let report = engine.verify_replay().await.unwrap();
        assert!(report.is_consistent(), "{:?}", report.mismatches);
    }

    #[tokio::test]
    async fn test_restart_restores_graph_resolver_and_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("graphweld.db");
        let migrations = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");

        let store = Arc::new(SqliteStore::open(&db_path, &migrations).await.unwrap());
        let engine = ConsolidationEngine::open(Config::default(), store)
            .await
            .unwrap();
        engine
            .submit_batch(vec![
                org("apple", "src-a", 0.9)
                    .with_attribute("founded_year", AttrValue::Number(1976.0))
                    .with_attribute("hq", AttrValue::Text("cupertino".into())),
                org("apple", "src-b", 0.9)
                    .with_attribute("founded_year", AttrValue::Number(1977.0))
                    .with_attribute("hq", AttrValue::Text("cupertino".into())),
                Mention::relationship(
                    "founded_by",
                    EntityRef::new("ORG", "apple"),
                    EntityRef::new("PERSON", "steve jobs"),
                    "src-a",
                    0.85,
                ),
            ])
            .await
            .unwrap();
        let before = engine.stats().await;
        let conflict_id = engine.conflicts(&ConflictFilter::default()).await[0].id;
        drop(engine);

        let store = Arc::new(SqliteStore::open(&db_path, &migrations).await.unwrap());
        let engine = ConsolidationEngine::open(Config::default(), store)
            .await
            .unwrap();
        let after = engine.stats().await;
        assert_eq!(after.live_entities, before.live_entities);
        assert_eq!(after.relationships, before.relationships);
        assert_eq!(after.ledger_entries, before.ledger_entries);
        assert_eq!(after.open_conflicts, before.open_conflicts);
        // stored conflict ids survive the restart
        assert!(engine.conflict(conflict_id).await.is_some());

        // the rebuilt block index attaches instead of duplicating, and the
        // ledger sequence continues past the stored entries
        let report = engine
            .submit_batch(vec![org("apple", "src-z", 0.95)])
            .await
            .unwrap();
        assert_eq!(report.entities_created, 0);
        assert_eq!(report.accepted, 1);
        assert_eq!(
            engine.stats().await.ledger_entries,
            before.ledger_entries + 1
        );
        assert_eq!(engine.stats().await.live_entities, before.live_entities);
    }

    #[tokio::test]
    async fn test_restart_folds_premerge_evidence_into_survivor() {
        let store = Arc::new(MemoryStore::new());
        let engine = ConsolidationEngine::open(Config::default(), store.clone())
            .await
            .unwrap();
        engine
            .submit_batch(vec![
                org("apple co", "src-a", 0.9)
                    .with_attribute("founded_year", AttrValue::Number(1976.0)),
            ])
            .await
            .unwrap();
        // hq=austin lands under this entity's id, which the later merge
        // turns into a tombstone
        engine
            .submit_batch(vec![org("apple incorporated", "src-b", 0.7)
                .with_attribute("founded_year", AttrValue::Number(1998.0))
                .with_attribute("hq", AttrValue::Text("austin".into()))])
            .await
            .unwrap();
        let snap = engine.snapshot(None).await;
        let id_a = snap
            .live_entities()
            .find(|e| e.value == "apple co")
            .unwrap()
            .id;
        let report = engine
            .submit_batch(vec![org("apple inc", "src-c", 0.95)])
            .await
            .unwrap();
        assert_eq!(report.merges, 1);
        drop(engine);

        // the reopened book must weigh austin exactly as the live one did:
        // a tied counter-assertion disputes the slot instead of replacing it
        let engine = ConsolidationEngine::open(Config::default(), store)
            .await
            .unwrap();
        let report = engine
            .submit_batch(vec![org("apple inc", "src-d", 0.7)
                .with_attribute("founded_year", AttrValue::Number(1976.0))
                .with_attribute("hq", AttrValue::Text("berlin".into()))])
            .await
            .unwrap();
        assert_eq!(report.disputed, 1);
        assert_eq!(report.conflicts_opened, 1);

        let survivor = engine.entity(id_a).await.unwrap();
        let slot = survivor.attributes.get("hq").unwrap();
        assert_eq!(slot.value, Some(AttrValue::Text("austin".into())));
        assert!(slot.disputed);

        let open = engine
            .conflicts(&ConflictFilter {
                status: Some(ConflictStatus::Disputed),
                ..Default::default()
            })
            .await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].subject, SubjectId::Entity(id_a));
        assert_eq!(open[0].attribute, "hq");
        assert_eq!(open[0].competing.len(), 2);

        let report = engine.verify_replay().await.unwrap();
        assert!(report.is_consistent(), "{:?}", report.mismatches);
    }

    /// Store that fails the next `failures` entity saves, then recovers.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    impl FlakyStore {
        fn failing(times: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicUsize::new(times),
            }
        }
    }

    #[async_trait]
    impl GraphStore for FlakyStore {
        async fn append_ledger(&self, entry: &LedgerEntry) -> Result<()> {
            self.inner.append_ledger(entry).await
        }

        async fn load_ledger(&self) -> Result<Vec<LedgerEntry>> {
            self.inner.load_ledger().await
        }

        async fn save_entity(&self, entity: &CanonicalEntity) -> Result<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(GraphweldError::StoreUnavailable("injected outage".into()));
            }
            self.inner.save_entity(entity).await
        }

        async fn load_entities(&self) -> Result<Vec<CanonicalEntity>> {
            self.inner.load_entities().await
        }

        async fn save_relationship(&self, rel: &CanonicalRelationship) -> Result<()> {
            self.inner.save_relationship(rel).await
        }

        async fn load_relationships(&self) -> Result<Vec<CanonicalRelationship>> {
            self.inner.load_relationships().await
        }

        async fn save_conflict(&self, record: &ConflictRecord) -> Result<()> {
            self.inner.save_conflict(record).await
        }

        async fn load_conflicts(&self) -> Result<Vec<ConflictRecord>> {
            self.inner.load_conflicts().await
        }
    }

    #[tokio::test]
    async fn test_retry_after_store_outage_repairs_store() {
        let store = Arc::new(FlakyStore::failing(1));
        let engine = ConsolidationEngine::open(Config::default(), store.clone())
            .await
            .unwrap();

        let mention = org("apple", "src-a", 0.9);
        let err = engine
            .submit_batch(vec![mention.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, GraphweldError::StoreUnavailable(_)));
        // ledger writes landed before the outage; the entity row did not
        assert_eq!(store.load_ledger().await.unwrap().len(), 2);
        assert!(store.load_entities().await.unwrap().is_empty());
        // in-memory state kept the mention, so the graph is already correct
        assert_eq!(engine.stats().await.live_entities, 1);

        // the resubmitted mention deduplicates, but the batch still flushes
        // the parked row into the recovered store
        let report = engine.submit_batch(vec![mention]).await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.accepted, 0);
        let entities = store.load_entities().await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].value, "apple");
        assert_eq!(store.load_ledger().await.unwrap().len(), 2);
        drop(engine);

        // a reopened engine sees a store that fully accounts for the ledger
        let engine = ConsolidationEngine::open(Config::default(), store)
            .await
            .unwrap();
        assert_eq!(engine.stats().await.live_entities, 1);
        let report = engine.verify_replay().await.unwrap();
        assert!(report.is_consistent(), "{:?}", report.mismatches);
    }
}
