//! Rebuild canonical state from the ledger alone.
//!
//! Replay applies the decisions the ledger recorded instead of re-deriving
//! them: entity ids, merge groups, and relationship endpoints come straight
//! from the entries, while attribute evaluation re-runs deterministically
//! over the same assertion order. Operator assertions (extraction method
//! "manual") are applied as forced accepts. [`verify`] then compares the
//! replayed graph against the live one subject by subject.

use std::collections::{BTreeMap, BTreeSet};

use crate::conflict::ConflictBook;
use crate::config::Config;
use crate::error::Result;
use crate::graph::{AttributeSlot, CanonicalGraph};
use crate::ledger::{LedgerEntry, LedgerOp};
use crate::model::{MentionId, SubjectId};

use super::{apply_evaluation, mirror_accepted, MANUAL_METHOD};

/// State rebuilt by [`replay`].
pub struct ReplayedState {
    pub graph: CanonicalGraph,
    pub conflicts: ConflictBook,
}

/// Divergences between the live graph and a ledger replay. Empty means the
/// ledger fully accounts for the canonical state.
#[derive(Debug, Default)]
pub struct ReplayReport {
    pub mismatches: Vec<String>,
}

impl ReplayReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Apply every ledger entry in order to an empty graph.
pub fn replay(config: &Config, entries: &[LedgerEntry]) -> Result<ReplayedState> {
    let mut graph = CanonicalGraph::new();
    let mut conflicts = ConflictBook::new(&config.conflict);

    for entry in entries {
        match &entry.op {
            LedgerOp::EntityCreated { entity_type, value } => {
                graph.create_entity_with_id(
                    entry.subject.uuid(),
                    entity_type.clone(),
                    value.clone(),
                    entry.confidence,
                    entry.seq,
                );
            }
            LedgerOp::MentionAttached {
                mention_id,
                tentative,
                surface,
                ..
            } => {
                graph.attach_mention(entry.subject, *mention_id, *tentative)?;
                match entry.subject {
                    SubjectId::Entity(id) => {
                        if !*tentative {
                            if let Some(surface) = surface {
                                graph.observe_surface_form(id, surface, entry.confidence)?;
                            }
                        }
                    }
                    SubjectId::Relationship(id) => {
                        graph.boost_relationship_confidence(id, entry.confidence)?;
                    }
                }
            }
            LedgerOp::AttributeAsserted { attribute, value } => {
                if entry.extraction_method == MANUAL_METHOD {
                    graph.accept_attribute(
                        entry.subject,
                        attribute,
                        value.clone(),
                        entry.assertion_id,
                    )?;
                    conflicts.record_manual(
                        entry.subject,
                        attribute,
                        value.clone(),
                        entry.confidence,
                        &entry.source_id,
                        entry.assertion_id,
                    );
                } else {
                    let eval = conflicts.evaluate(
                        entry.subject,
                        attribute,
                        value.clone(),
                        entry.confidence,
                        &entry.source_id,
                        entry.assertion_id,
                    );
                    apply_evaluation(
                        &mut graph,
                        entry.subject,
                        attribute,
                        &eval,
                        entry.assertion_id,
                    )?;
                }
            }
            LedgerOp::RelationshipCreated {
                rel_type,
                source,
                target,
            } => {
                graph.upsert_relationship_with_id(
                    entry.subject.uuid(),
                    rel_type,
                    *source,
                    *target,
                    entry.confidence,
                    entry.seq,
                )?;
            }
            LedgerOp::Merged { absorbed } => {
                let loser_subjects: Vec<SubjectId> =
                    absorbed.iter().copied().map(SubjectId::Entity).collect();
                conflicts.retarget(entry.subject, &loser_subjects);
                let merge = graph.apply_merge(entry.subject.uuid(), absorbed)?;
                for (dropped, kept) in &merge.folded_relationships {
                    conflicts.retarget(
                        SubjectId::Relationship(*kept),
                        &[SubjectId::Relationship(*dropped)],
                    );
                }
                mirror_accepted(&graph, &mut conflicts, entry.subject);
                for (_, kept) in &merge.folded_relationships {
                    mirror_accepted(&graph, &mut conflicts, SubjectId::Relationship(*kept));
                }
            }
            LedgerOp::ConflictReopened { attribute, .. } => {
                conflicts.reopen_slot(entry.subject, attribute);
                graph.dispute_attribute(entry.subject, attribute)?;
            }
        }
    }
    Ok(ReplayedState { graph, conflicts })
}

/// Compare the live graph against a replayed one. Revision counters are not
/// compared; they count write-lock churn, not canonical content.
pub fn verify(live: &CanonicalGraph, replayed: &CanonicalGraph) -> ReplayReport {
    let mut report = ReplayReport::default();

    let live_ids = live.live_entity_ids();
    let replayed_ids = replayed.live_entity_ids();
    if live_ids != replayed_ids {
        report.mismatches.push(format!(
            "live entity sets differ: {} live vs {} replayed",
            live_ids.len(),
            replayed_ids.len()
        ));
    }

    for id in live_ids
        .iter()
        .filter(|id| replayed_ids.binary_search(id).is_ok())
    {
        let (Some(a), Some(b)) = (live.entity(*id), replayed.entity(*id)) else {
            continue;
        };
        if a.entity_type != b.entity_type || a.value != b.value {
            report.mismatches.push(format!(
                "entity {}: '{}' ({}) replayed as '{}' ({})",
                id, a.value, a.entity_type, b.value, b.entity_type
            ));
        }
        if a.aliases != b.aliases {
            report
                .mismatches
                .push(format!("entity {}: alias sets differ", id));
        }
        if mention_set(&a.mention_ids) != mention_set(&b.mention_ids)
            || mention_set(&a.tentative_mention_ids) != mention_set(&b.tentative_mention_ids)
        {
            report
                .mismatches
                .push(format!("entity {}: mention sets differ", id));
        }
        compare_attributes(
            &mut report,
            &format!("entity {}", id),
            &a.attributes,
            &b.attributes,
        );
    }

    let live_snap = live.snapshot(None);
    let replayed_snap = replayed.snapshot(None);
    let live_rel_ids: Vec<_> = live_snap.relationships.iter().map(|r| r.id).collect();
    let replayed_rel_ids: Vec<_> = replayed_snap.relationships.iter().map(|r| r.id).collect();
    if live_rel_ids != replayed_rel_ids {
        report.mismatches.push(format!(
            "relationship sets differ: {} live vs {} replayed",
            live_rel_ids.len(),
            replayed_rel_ids.len()
        ));
    }
    for a in &live_snap.relationships {
        let Some(b) = replayed_snap.relationships.iter().find(|r| r.id == a.id) else {
            continue;
        };
        if a.rel_type != b.rel_type || a.source != b.source || a.target != b.target {
            report.mismatches.push(format!(
                "relationship {}: endpoints or type differ after replay",
                a.id
            ));
        }
        if a.merged_into != b.merged_into {
            report.mismatches.push(format!(
                "relationship {}: fold target differs after replay",
                a.id
            ));
        }
        if mention_set(&a.mention_ids) != mention_set(&b.mention_ids) {
            report
                .mismatches
                .push(format!("relationship {}: mention sets differ", a.id));
        }
        compare_attributes(
            &mut report,
            &format!("relationship {}", a.id),
            &a.attributes,
            &b.attributes,
        );
    }

    report
}

fn mention_set(ids: &[MentionId]) -> BTreeSet<MentionId> {
    ids.iter().copied().collect()
}

fn compare_attributes(
    report: &mut ReplayReport,
    what: &str,
    a: &BTreeMap<String, AttributeSlot>,
    b: &BTreeMap<String, AttributeSlot>,
) {
    if a.keys().ne(b.keys()) {
        report
            .mismatches
            .push(format!("{}: attribute keys differ", what));
    }
    for (attr, slot_a) in a {
        let Some(slot_b) = b.get(attr) else {
            continue;
        };
        if slot_a.value != slot_b.value {
            report.mismatches.push(format!(
                "{}: attribute '{}' value differs after replay",
                what, attr
            ));
        }
        if slot_a.disputed != slot_b.disputed {
            report.mismatches.push(format!(
                "{}: attribute '{}' dispute flag differs after replay",
                what, attr
            ));
        }
        if slot_a.provenance != slot_b.provenance {
            report.mismatches.push(format!(
                "{}: attribute '{}' provenance differs after replay",
                what, attr
            ));
        }
    }
}
