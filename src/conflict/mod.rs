//! Conflict detection and resolution for attribute slots.
//!
//! The book tracks every distinct value asserted for a `(subject, attribute)`
//! slot. When values disagree, a layered policy decides: a clear confidence
//! margin wins first, then corroboration by more distinct sources, otherwise
//! the slot is disputed. Every disagreement leaves a conflict record holding
//! all competing values; a record the policy settled on the spot is born
//! resolved, and repeated losing assertions refresh it rather than piling up
//! duplicates. Records move from disputed to resolved only; renewed
//! disagreement after a resolution opens a fresh record instead of flipping
//! the old one back.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConflictConfig;
use crate::error::{GraphweldError, Result};
use crate::graph::CanonicalGraph;
use crate::ledger::{AssertionId, LedgerEntry, LedgerOp};
use crate::model::{AttrValue, SubjectId};

pub type ConflictId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Disputed,
    Resolved,
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStatus::Disputed => write!(f, "disputed"),
            ConflictStatus::Resolved => write!(f, "resolved"),
        }
    }
}

/// How a resolved record was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    /// One value led every other by the confidence margin
    Margin,
    /// Strictly more distinct sources than any competitor
    Corroboration,
    /// Operator decision
    Manual,
}

impl fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionMethod::Margin => write!(f, "margin"),
            ResolutionMethod::Corroboration => write!(f, "corroboration"),
            ResolutionMethod::Manual => write!(f, "manual"),
        }
    }
}

/// One value competing for a slot, aggregated across assertions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetingValue {
    pub value: AttrValue,
    /// Highest confidence any assertion gave this value
    pub confidence: f64,
    /// Distinct sources that asserted it
    pub sources: BTreeSet<String>,
    pub assertions: Vec<AssertionId>,
}

impl CompetingValue {
    fn new(value: AttrValue, confidence: f64, source: &str, assertion: AssertionId) -> Self {
        let mut sources = BTreeSet::new();
        sources.insert(source.to_string());
        Self {
            value,
            confidence,
            sources,
            assertions: vec![assertion],
        }
    }

    fn absorb(&mut self, confidence: f64, source: &str, assertion: AssertionId) {
        if confidence > self.confidence {
            self.confidence = confidence;
        }
        self.sources.insert(source.to_string());
        if !self.assertions.contains(&assertion) {
            self.assertions.push(assertion);
        }
    }
}

/// A disagreement episode on one attribute slot. Opened on first
/// disagreement whether or not the policy could settle it; a record the
/// policy settled immediately starts out resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub subject: SubjectId,
    pub attribute: String,
    pub status: ConflictStatus,
    pub competing: Vec<CompetingValue>,
    /// Canonical key of the winning value once resolved
    pub accepted_key: Option<String>,
    /// Policy tier (or operator) that settled this record
    pub resolution_method: Option<ResolutionMethod>,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator note for manual resolutions
    pub resolution_note: Option<String>,
    /// Resolved record this dispute revives, if it was manually reopened
    pub reopened_from: Option<ConflictId>,
}

/// Picks a winner among competing values and names the deciding tier, or
/// returns None to dispute the slot.
pub trait ResolutionPolicy: Send + Sync {
    fn pick<'a>(
        &self,
        values: &'a [CompetingValue],
    ) -> Option<(&'a CompetingValue, ResolutionMethod)>;
}

/// Margin first, corroboration second.
pub struct LayeredPolicy {
    margin: f64,
}

impl LayeredPolicy {
    pub fn new(margin: f64) -> Self {
        Self { margin }
    }
}

impl ResolutionPolicy for LayeredPolicy {
    fn pick<'a>(
        &self,
        values: &'a [CompetingValue],
    ) -> Option<(&'a CompetingValue, ResolutionMethod)> {
        if values.len() < 2 {
            return values.first().map(|v| (v, ResolutionMethod::Margin));
        }

        // tier 1: one value leads every other by the confidence margin
        let mut by_conf: Vec<&CompetingValue> = values.iter().collect();
        by_conf.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if by_conf[0].confidence - by_conf[1].confidence >= self.margin {
            return Some((by_conf[0], ResolutionMethod::Margin));
        }

        // tier 2: strictly more distinct sources than any other value
        let mut by_sources: Vec<&CompetingValue> = values.iter().collect();
        by_sources.sort_by(|a, b| b.sources.len().cmp(&a.sources.len()));
        if by_sources[0].sources.len() > by_sources[1].sources.len() {
            return Some((by_sources[0], ResolutionMethod::Corroboration));
        }

        None
    }
}

/// Result of evaluating one assertion against a slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// This value is (now) the accepted one; the slot changed or a dispute
    /// was settled.
    Accepted {
        value: AttrValue,
        previous: Option<AttrValue>,
        /// Open dispute this evidence settled
        resolved_conflict: Option<ConflictId>,
        /// Record written for a displacement the policy settled on the spot
        record: Option<ConflictId>,
    },
    /// The assertion supports the value that was already accepted.
    Corroborated { value: AttrValue },
    /// The assertion lost; the accepted value stands. It is still part of
    /// the slot's history and counts toward future evaluations.
    Superseded {
        accepted: AttrValue,
        /// Record holding the losing value alongside the winner
        record: ConflictId,
    },
    /// No winner; the slot is disputed.
    Disputed { conflict_id: ConflictId, opened: bool },
}

#[derive(Debug, Default)]
struct SlotState {
    values: Vec<CompetingValue>,
    /// Canonical key of the accepted value, mirroring the graph slot
    accepted: Option<String>,
    open_conflict: Option<ConflictId>,
    /// Most recent record for this slot, any status
    last_conflict: Option<ConflictId>,
}

impl SlotState {
    fn find_mut(&mut self, key: &str) -> Option<&mut CompetingValue> {
        self.values.iter_mut().find(|v| v.value.canonical_key() == key)
    }

    fn accepted_value(&self) -> Option<&AttrValue> {
        let key = self.accepted.as_deref()?;
        self.values
            .iter()
            .find(|v| v.value.canonical_key() == key)
            .map(|v| &v.value)
    }
}

/// Filter for conflict listings.
#[derive(Debug, Clone, Default)]
pub struct ConflictFilter {
    pub status: Option<ConflictStatus>,
    pub subject: Option<SubjectId>,
    pub attribute: Option<String>,
}

/// All conflict state for the engine: per-slot value history plus the
/// conflict records themselves.
pub struct ConflictBook {
    policy: Box<dyn ResolutionPolicy>,
    slots: HashMap<(SubjectId, String), SlotState>,
    records: HashMap<ConflictId, ConflictRecord>,
}

impl ConflictBook {
    pub fn new(config: &ConflictConfig) -> Self {
        Self::with_policy(Box::new(LayeredPolicy::new(config.confidence_margin)))
    }

    pub fn with_policy(policy: Box<dyn ResolutionPolicy>) -> Self {
        Self {
            policy,
            slots: HashMap::new(),
            records: HashMap::new(),
        }
    }

    /// Evaluate one assertion. The caller has already appended it to the
    /// ledger; this decides what the canonical slot should say.
    pub fn evaluate(
        &mut self,
        subject: SubjectId,
        attribute: &str,
        value: AttrValue,
        confidence: f64,
        source_id: &str,
        assertion: AssertionId,
    ) -> Evaluation {
        let slot = self
            .slots
            .entry((subject, attribute.to_string()))
            .or_default();
        let key = value.canonical_key();

        match slot.find_mut(&key) {
            Some(existing) => existing.absorb(confidence, source_id, assertion),
            None => slot
                .values
                .push(CompetingValue::new(value.clone(), confidence, source_id, assertion)),
        }

        // single-value slots accept or corroborate without consulting policy
        if slot.values.len() == 1 {
            if slot.accepted.as_deref() == Some(key.as_str()) {
                return Evaluation::Corroborated { value };
            }
            slot.accepted = Some(key);
            return Evaluation::Accepted {
                value,
                previous: None,
                resolved_conflict: None,
                record: None,
            };
        }

        match self.policy.pick(&slot.values) {
            Some((winner, method)) => {
                let winner_value = winner.value.clone();
                let winner_key = winner_value.canonical_key();
                let previous = slot.accepted_value().cloned();
                let open = slot.open_conflict.take();

                if let Some(conflict_id) = open {
                    if let Some(record) = self.records.get_mut(&conflict_id) {
                        record.status = ConflictStatus::Resolved;
                        record.accepted_key = Some(winner_key.clone());
                        record.resolution_method = Some(method);
                        record.resolved_at = Some(Utc::now());
                        record.competing = slot.values.clone();
                    }
                    log::info!(
                        "conflict {} on {}.{} settled by new evidence ({})",
                        conflict_id,
                        subject,
                        attribute,
                        method
                    );
                    slot.accepted = Some(winner_key);
                    return Evaluation::Accepted {
                        value: winner_value,
                        previous,
                        resolved_conflict: Some(conflict_id),
                        record: None,
                    };
                }

                if slot.accepted.as_deref() == Some(winner_key.as_str()) {
                    if key == winner_key {
                        Evaluation::Corroborated {
                            value: winner_value,
                        }
                    } else {
                        // the newcomer disagreed and lost; the episode gets a
                        // resolved record holding both values
                        let record = Self::upsert_resolved(
                            &mut self.records,
                            slot,
                            subject,
                            attribute,
                            &winner_key,
                            method,
                        );
                        Evaluation::Superseded {
                            accepted: winner_value,
                            record,
                        }
                    }
                } else {
                    let record = previous.is_some().then(|| {
                        Self::upsert_resolved(
                            &mut self.records,
                            slot,
                            subject,
                            attribute,
                            &winner_key,
                            method,
                        )
                    });
                    slot.accepted = Some(winner_key);
                    Evaluation::Accepted {
                        value: winner_value,
                        previous,
                        resolved_conflict: None,
                        record,
                    }
                }
            }
            None => {
                if let Some(conflict_id) = slot.open_conflict {
                    if let Some(record) = self.records.get_mut(&conflict_id) {
                        record.competing = slot.values.clone();
                    }
                    return Evaluation::Disputed {
                        conflict_id,
                        opened: false,
                    };
                }
                let record = ConflictRecord {
                    id: Uuid::new_v4(),
                    subject,
                    attribute: attribute.to_string(),
                    status: ConflictStatus::Disputed,
                    competing: slot.values.clone(),
                    accepted_key: None,
                    resolution_method: None,
                    opened_at: Utc::now(),
                    resolved_at: None,
                    resolution_note: None,
                    reopened_from: None,
                };
                let conflict_id = record.id;
                slot.open_conflict = Some(conflict_id);
                slot.last_conflict = Some(conflict_id);
                self.records.insert(conflict_id, record);
                log::info!(
                    "conflict opened on {}.{}: no value wins",
                    subject,
                    attribute
                );
                Evaluation::Disputed {
                    conflict_id,
                    opened: true,
                }
            }
        }
    }

    /// Write or refresh the slot's resolved record for a displacement the
    /// policy settled without a dispute. The slot's latest record is reused
    /// while it stays resolved, so repeated losing assertions never multiply
    /// records; its method and winner only change when the winner changes.
    fn upsert_resolved(
        records: &mut HashMap<ConflictId, ConflictRecord>,
        slot: &mut SlotState,
        subject: SubjectId,
        attribute: &str,
        winner_key: &str,
        method: ResolutionMethod,
    ) -> ConflictId {
        if let Some(id) = slot.last_conflict {
            if let Some(record) = records.get_mut(&id) {
                if record.status == ConflictStatus::Resolved {
                    record.competing = slot.values.clone();
                    if record.accepted_key.as_deref() != Some(winner_key) {
                        record.accepted_key = Some(winner_key.to_string());
                        record.resolution_method = Some(method);
                        record.resolved_at = Some(Utc::now());
                    }
                    return id;
                }
            }
        }
        let id = Uuid::new_v4();
        records.insert(
            id,
            ConflictRecord {
                id,
                subject,
                attribute: attribute.to_string(),
                status: ConflictStatus::Resolved,
                competing: slot.values.clone(),
                accepted_key: Some(winner_key.to_string()),
                resolution_method: Some(method),
                opened_at: Utc::now(),
                resolved_at: Some(Utc::now()),
                resolution_note: None,
                reopened_from: None,
            },
        );
        slot.last_conflict = Some(id);
        log::debug!(
            "recorded settled disagreement on {}.{} ({})",
            subject,
            attribute,
            method
        );
        id
    }

    /// Manually settle a dispute on one of its competing values.
    pub fn resolve_manual(
        &mut self,
        conflict_id: ConflictId,
        chosen: &AttrValue,
        note: Option<String>,
    ) -> Result<ConflictRecord> {
        let record = self
            .records
            .get_mut(&conflict_id)
            .ok_or_else(|| GraphweldError::ConflictNotFound(conflict_id.to_string()))?;
        if record.status == ConflictStatus::Resolved {
            return Err(GraphweldError::Validation(format!(
                "conflict {} is already resolved",
                conflict_id
            )));
        }
        let chosen_key = chosen.canonical_key();
        if !record
            .competing
            .iter()
            .any(|v| v.value.canonical_key() == chosen_key)
        {
            return Err(GraphweldError::Validation(format!(
                "value {} is not among the competing values of conflict {}",
                chosen, conflict_id
            )));
        }

        record.status = ConflictStatus::Resolved;
        record.accepted_key = Some(chosen_key.clone());
        record.resolution_method = Some(ResolutionMethod::Manual);
        record.resolved_at = Some(Utc::now());
        record.resolution_note = note;
        let resolved = record.clone();

        let slot_key = (record.subject, record.attribute.clone());
        if let Some(slot) = self.slots.get_mut(&slot_key) {
            slot.accepted = Some(chosen_key);
            if slot.open_conflict == Some(conflict_id) {
                slot.open_conflict = None;
            }
            slot.last_conflict = Some(conflict_id);
        }
        Ok(resolved)
    }

    /// Reopen a resolved conflict. The old record keeps its resolved state;
    /// a new disputed record takes over, linked via `reopened_from`.
    pub fn reopen(&mut self, conflict_id: ConflictId) -> Result<ConflictRecord> {
        let prior = self
            .records
            .get(&conflict_id)
            .ok_or_else(|| GraphweldError::ConflictNotFound(conflict_id.to_string()))?;
        if prior.status != ConflictStatus::Resolved {
            return Err(GraphweldError::Validation(format!(
                "conflict {} is still open",
                conflict_id
            )));
        }
        let subject = prior.subject;
        let attribute = prior.attribute.clone();
        let competing = prior.competing.clone();

        let slot_key = (subject, attribute.clone());
        let slot = self.slots.entry(slot_key).or_default();
        if let Some(existing) = slot.open_conflict {
            return Err(GraphweldError::Validation(format!(
                "slot already has open conflict {}",
                existing
            )));
        }

        let record = ConflictRecord {
            id: Uuid::new_v4(),
            subject,
            attribute,
            status: ConflictStatus::Disputed,
            competing,
            accepted_key: None,
            resolution_method: None,
            opened_at: Utc::now(),
            resolved_at: None,
            resolution_note: None,
            reopened_from: Some(conflict_id),
        };
        slot.open_conflict = Some(record.id);
        slot.last_conflict = Some(record.id);
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    /// Reopen the dispute on a slot during replay. Replay does not reproduce
    /// recorded conflict ids, so this reopens by slot: a fresh disputed
    /// record over the current competing values, linked to the slot's latest
    /// record. A no-op when the slot is already disputed.
    pub fn reopen_slot(&mut self, subject: SubjectId, attribute: &str) {
        let slot = self
            .slots
            .entry((subject, attribute.to_string()))
            .or_default();
        if slot.open_conflict.is_some() {
            return;
        }
        let record = ConflictRecord {
            id: Uuid::new_v4(),
            subject,
            attribute: attribute.to_string(),
            status: ConflictStatus::Disputed,
            competing: slot.values.clone(),
            accepted_key: None,
            resolution_method: None,
            opened_at: Utc::now(),
            resolved_at: None,
            resolution_note: None,
            reopened_from: slot.last_conflict,
        };
        slot.open_conflict = Some(record.id);
        slot.last_conflict = Some(record.id);
        self.records.insert(record.id, record);
    }

    pub fn get(&self, id: ConflictId) -> Option<&ConflictRecord> {
        self.records.get(&id)
    }

    /// Records matching a filter, oldest first.
    pub fn list(&self, filter: &ConflictFilter) -> Vec<ConflictRecord> {
        let mut out: Vec<ConflictRecord> = self
            .records
            .values()
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| filter.subject.map_or(true, |s| r.subject == s))
            .filter(|r| {
                filter
                    .attribute
                    .as_deref()
                    .map_or(true, |a| r.attribute == a)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.opened_at, a.id).cmp(&(b.opened_at, b.id)));
        out
    }

    pub fn all_records(&self) -> Vec<ConflictRecord> {
        self.list(&ConflictFilter::default())
    }

    pub fn open_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status == ConflictStatus::Disputed)
            .count()
    }

    /// Retarget conflict state when `loser` entities merge into `winner`.
    /// Slot histories fold together; open records follow their slots.
    /// Returns the records whose subject changed, for persistence.
    pub fn retarget(&mut self, winner: SubjectId, losers: &[SubjectId]) -> Vec<ConflictRecord> {
        let loser_keys: Vec<(SubjectId, String)> = self
            .slots
            .keys()
            .filter(|(subject, _)| losers.contains(subject))
            .cloned()
            .collect();
        for (subject, attribute) in loser_keys {
            if let Some(state) = self.slots.remove(&(subject, attribute.clone())) {
                let target = self
                    .slots
                    .entry((winner, attribute.clone()))
                    .or_default();
                for value in state.values {
                    match target
                        .values
                        .iter_mut()
                        .find(|v| v.value.canonical_key() == value.value.canonical_key())
                    {
                        Some(existing) => {
                            if value.confidence > existing.confidence {
                                existing.confidence = value.confidence;
                            }
                            existing.sources.extend(value.sources);
                            for a in value.assertions {
                                if !existing.assertions.contains(&a) {
                                    existing.assertions.push(a);
                                }
                            }
                        }
                        None => target.values.push(value),
                    }
                }
                // the winner's own dispute (if any) stays open; a loser's
                // dispute transfers only when the winner has none
                if target.open_conflict.is_none() && state.open_conflict.is_some() {
                    target.open_conflict = state.open_conflict;
                    target.last_conflict = state.open_conflict;
                }
                if target.last_conflict.is_none() {
                    target.last_conflict = state.last_conflict;
                }
            }
        }
        let mut changed = Vec::new();
        for record in self.records.values_mut() {
            if losers.contains(&record.subject) {
                record.subject = winner;
                changed.push(record.clone());
            }
        }
        changed.sort_by(|a, b| (a.opened_at, a.id).cmp(&(b.opened_at, b.id)));
        changed
    }

    /// Rebuild slot histories from ledger entries and overlay persisted
    /// records. Subjects collapse through the restored graph's merge
    /// redirects so evidence recorded before a merge lands on the same slot
    /// `retarget` folded it into while the engine was live. Accepted keys
    /// are set afterwards by the caller from the graph, which is
    /// authoritative for slot values.
    pub fn restore(
        &mut self,
        graph: &CanonicalGraph,
        entries: &[LedgerEntry],
        records: Vec<ConflictRecord>,
    ) {
        for entry in entries {
            if let LedgerOp::AttributeAsserted { attribute, value } = &entry.op {
                let subject = graph.resolve_subject(entry.subject);
                let slot = self.slots.entry((subject, attribute.clone())).or_default();
                let key = value.canonical_key();
                match slot.find_mut(&key) {
                    Some(existing) => {
                        existing.absorb(entry.confidence, &entry.source_id, entry.assertion_id)
                    }
                    None => slot.values.push(CompetingValue::new(
                        value.clone(),
                        entry.confidence,
                        &entry.source_id,
                        entry.assertion_id,
                    )),
                }
            }
        }
        // records arrive oldest first, so each slot ends up pointing at its
        // newest record
        for mut record in records {
            record.subject = graph.resolve_subject(record.subject);
            let slot = self
                .slots
                .entry((record.subject, record.attribute.clone()))
                .or_default();
            if record.status == ConflictStatus::Disputed {
                slot.open_conflict = Some(record.id);
            }
            slot.last_conflict = Some(record.id);
            self.records.insert(record.id, record);
        }
    }

    /// Mirror an accepted slot value from the restored graph.
    pub fn set_accepted(&mut self, subject: SubjectId, attribute: &str, key: Option<String>) {
        let slot = self
            .slots
            .entry((subject, attribute.to_string()))
            .or_default();
        slot.accepted = key;
    }

    /// Fold an operator assertion into the slot's history and accept it.
    /// The operator's confidence then weighs against future evidence exactly
    /// as it would after a restart, where `restore` folds the same entry.
    /// Any dispute still open on the slot is settled on the chosen value.
    pub fn record_manual(
        &mut self,
        subject: SubjectId,
        attribute: &str,
        value: AttrValue,
        confidence: f64,
        source_id: &str,
        assertion: AssertionId,
    ) {
        let slot = self
            .slots
            .entry((subject, attribute.to_string()))
            .or_default();
        let key = value.canonical_key();
        match slot.find_mut(&key) {
            Some(existing) => existing.absorb(confidence, source_id, assertion),
            None => slot
                .values
                .push(CompetingValue::new(value, confidence, source_id, assertion)),
        }
        slot.accepted = Some(key.clone());
        if let Some(conflict_id) = slot.open_conflict.take() {
            slot.last_conflict = Some(conflict_id);
            if let Some(record) = self.records.get_mut(&conflict_id) {
                record.status = ConflictStatus::Resolved;
                record.accepted_key = Some(key);
                record.resolution_method = Some(ResolutionMethod::Manual);
                record.resolved_at = Some(Utc::now());
                record.competing = slot.values.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> ConflictBook {
        ConflictBook::new(&ConflictConfig::default())
    }

    fn subject() -> SubjectId {
        SubjectId::Entity(Uuid::new_v4())
    }

    #[test]
    fn test_first_value_accepted() {
        let mut b = book();
        let s = subject();
        let eval = b.evaluate(
            s,
            "founded_year",
            AttrValue::Number(1976.0),
            0.9,
            "src-a",
            Uuid::new_v4(),
        );
        assert_eq!(
            eval,
            Evaluation::Accepted {
                value: AttrValue::Number(1976.0),
                previous: None,
                resolved_conflict: None,
                record: None,
            }
        );
        assert!(b.all_records().is_empty());
    }

    #[test]
    fn test_margin_keeps_stronger_value() {
        let mut b = book();
        let s = subject();
        b.evaluate(s, "founded_year", AttrValue::Number(1976.0), 0.9, "src-a", Uuid::new_v4());
        // 0.9 vs 0.6 clears the 0.15 margin: 1976 stands, 1977 recorded as history
        let eval = b.evaluate(
            s,
            "founded_year",
            AttrValue::Number(1977.0),
            0.6,
            "src-b",
            Uuid::new_v4(),
        );
        let record_id = match eval {
            Evaluation::Superseded { accepted, record } => {
                assert_eq!(accepted, AttrValue::Number(1976.0));
                record
            }
            other => panic!("expected superseded, got {:?}", other),
        };

        // the disagreement is on file even though it never blocked the slot
        let record = b.get(record_id).unwrap();
        assert_eq!(record.status, ConflictStatus::Resolved);
        assert_eq!(record.accepted_key.as_deref(), Some("n:1976"));
        assert_eq!(record.resolution_method, Some(ResolutionMethod::Margin));
        assert_eq!(record.competing.len(), 2);
        assert_eq!(b.all_records().len(), 1);
        assert_eq!(b.open_count(), 0);
    }

    #[test]
    fn test_repeated_losing_assertion_reuses_record() {
        let mut b = book();
        let s = subject();
        b.evaluate(s, "founded_year", AttrValue::Number(1976.0), 0.9, "src-a", Uuid::new_v4());
        let first = b.evaluate(
            s,
            "founded_year",
            AttrValue::Number(1977.0),
            0.6,
            "src-b",
            Uuid::new_v4(),
        );
        let second = b.evaluate(
            s,
            "founded_year",
            AttrValue::Number(1977.0),
            0.6,
            "src-b",
            Uuid::new_v4(),
        );
        let (Evaluation::Superseded { record: r1, .. }, Evaluation::Superseded { record: r2, .. }) =
            (first, second)
        else {
            panic!("expected superseded twice");
        };
        assert_eq!(r1, r2);
        assert_eq!(b.all_records().len(), 1);
    }

    #[test]
    fn test_margin_flips_to_stronger_newcomer() {
        let mut b = book();
        let s = subject();
        b.evaluate(s, "hq", AttrValue::Text("cupertino".into()), 0.6, "src-a", Uuid::new_v4());
        let eval = b.evaluate(
            s,
            "hq",
            AttrValue::Text("austin".into()),
            0.95,
            "src-b",
            Uuid::new_v4(),
        );
        match eval {
            Evaluation::Accepted {
                value,
                previous,
                record,
                ..
            } => {
                assert_eq!(value, AttrValue::Text("austin".into()));
                assert_eq!(previous, Some(AttrValue::Text("cupertino".into())));
                let record = b.get(record.unwrap()).unwrap();
                assert_eq!(record.status, ConflictStatus::Resolved);
                assert_eq!(record.accepted_key.as_deref(), Some("s:austin"));
            }
            other => panic!("expected flip, got {:?}", other),
        }
    }

    #[test]
    fn test_equal_confidence_tie_disputes() {
        let mut b = book();
        let s = subject();
        b.evaluate(s, "founded_year", AttrValue::Number(1976.0), 0.8, "src-a", Uuid::new_v4());
        let eval = b.evaluate(
            s,
            "founded_year",
            AttrValue::Number(1977.0),
            0.8,
            "src-b",
            Uuid::new_v4(),
        );
        match eval {
            Evaluation::Disputed { opened, .. } => assert!(opened),
            other => panic!("expected dispute, got {:?}", other),
        }
        assert_eq!(b.open_count(), 1);
    }

    #[test]
    fn test_corroboration_breaks_tie_and_resolves() {
        let mut b = book();
        let s = subject();
        b.evaluate(s, "founded_year", AttrValue::Number(1976.0), 0.8, "src-a", Uuid::new_v4());
        let disputed = b.evaluate(
            s,
            "founded_year",
            AttrValue::Number(1977.0),
            0.8,
            "src-b",
            Uuid::new_v4(),
        );
        let Evaluation::Disputed { conflict_id, .. } = disputed else {
            panic!("expected dispute");
        };

        // a second distinct source for 1976 outnumbers 1977
        let eval = b.evaluate(
            s,
            "founded_year",
            AttrValue::Number(1976.0),
            0.8,
            "src-c",
            Uuid::new_v4(),
        );
        match eval {
            Evaluation::Accepted {
                value,
                resolved_conflict,
                ..
            } => {
                assert_eq!(value, AttrValue::Number(1976.0));
                assert_eq!(resolved_conflict, Some(conflict_id));
            }
            other => panic!("expected resolution, got {:?}", other),
        }
        let record = b.get(conflict_id).unwrap();
        assert_eq!(record.status, ConflictStatus::Resolved);
        assert_eq!(
            record.resolution_method,
            Some(ResolutionMethod::Corroboration)
        );
        assert!(record.resolved_at.is_some());
        assert_eq!(b.open_count(), 0);
    }

    #[test]
    fn test_same_source_repetition_does_not_corroborate() {
        let mut b = book();
        let s = subject();
        b.evaluate(s, "founded_year", AttrValue::Number(1976.0), 0.8, "src-a", Uuid::new_v4());
        b.evaluate(s, "founded_year", AttrValue::Number(1977.0), 0.8, "src-b", Uuid::new_v4());
        // src-a repeating itself adds no distinct source; dispute stands
        let eval = b.evaluate(
            s,
            "founded_year",
            AttrValue::Number(1976.0),
            0.8,
            "src-a",
            Uuid::new_v4(),
        );
        match eval {
            Evaluation::Disputed { opened, .. } => assert!(!opened),
            other => panic!("expected standing dispute, got {:?}", other),
        }
        assert_eq!(b.open_count(), 1);
    }

    #[test]
    fn test_corroborating_accepted_value() {
        let mut b = book();
        let s = subject();
        b.evaluate(s, "hq", AttrValue::Text("cupertino".into()), 0.9, "src-a", Uuid::new_v4());
        let eval = b.evaluate(
            s,
            "hq",
            AttrValue::Text("cupertino".into()),
            0.7,
            "src-b",
            Uuid::new_v4(),
        );
        assert_eq!(
            eval,
            Evaluation::Corroborated {
                value: AttrValue::Text("cupertino".into())
            }
        );
    }

    #[test]
    fn test_manual_resolution() {
        let mut b = book();
        let s = subject();
        b.evaluate(s, "founded_year", AttrValue::Number(1976.0), 0.8, "src-a", Uuid::new_v4());
        let Evaluation::Disputed { conflict_id, .. } = b.evaluate(
            s,
            "founded_year",
            AttrValue::Number(1977.0),
            0.8,
            "src-b",
            Uuid::new_v4(),
        ) else {
            panic!("expected dispute");
        };

        // a value outside the competition is rejected
        let err = b
            .resolve_manual(conflict_id, &AttrValue::Number(2001.0), None)
            .unwrap_err();
        assert!(matches!(err, GraphweldError::Validation(_)));

        let record = b
            .resolve_manual(
                conflict_id,
                &AttrValue::Number(1976.0),
                Some("checked registry".to_string()),
            )
            .unwrap();
        assert_eq!(record.status, ConflictStatus::Resolved);
        assert_eq!(record.resolution_method, Some(ResolutionMethod::Manual));
        assert_eq!(record.resolution_note.as_deref(), Some("checked registry"));
        assert_eq!(b.open_count(), 0);

        // double resolution is refused
        assert!(b
            .resolve_manual(conflict_id, &AttrValue::Number(1976.0), None)
            .is_err());
    }

    #[test]
    fn test_manual_record_outweighs_later_evidence() {
        let mut b = book();
        let s = subject();
        b.evaluate(s, "founded_year", AttrValue::Number(1976.0), 0.8, "src-a", Uuid::new_v4());
        let Evaluation::Disputed { conflict_id, .. } = b.evaluate(
            s,
            "founded_year",
            AttrValue::Number(1977.0),
            0.8,
            "src-b",
            Uuid::new_v4(),
        ) else {
            panic!("expected dispute");
        };
        b.resolve_manual(conflict_id, &AttrValue::Number(1977.0), None)
            .unwrap();
        b.record_manual(
            s,
            "founded_year",
            AttrValue::Number(1977.0),
            1.0,
            "operator",
            Uuid::new_v4(),
        );

        // a third source for 1976 would outnumber 1977 on its own, but the
        // operator's full-confidence vote keeps the settled value in place
        let eval = b.evaluate(
            s,
            "founded_year",
            AttrValue::Number(1976.0),
            0.8,
            "src-c",
            Uuid::new_v4(),
        );
        match eval {
            Evaluation::Superseded { accepted, record } => {
                assert_eq!(accepted, AttrValue::Number(1977.0));
                // the operator's record absorbs the late evidence and keeps
                // its manual stamp
                assert_eq!(record, conflict_id);
            }
            other => panic!("expected superseded, got {:?}", other),
        }
        let record = b.get(conflict_id).unwrap();
        assert_eq!(record.resolution_method, Some(ResolutionMethod::Manual));
        assert_eq!(record.competing.len(), 2);
        assert_eq!(b.open_count(), 0);
    }

    #[test]
    fn test_reopen_creates_new_record() {
        let mut b = book();
        let s = subject();
        b.evaluate(s, "founded_year", AttrValue::Number(1976.0), 0.8, "src-a", Uuid::new_v4());
        let Evaluation::Disputed { conflict_id, .. } = b.evaluate(
            s,
            "founded_year",
            AttrValue::Number(1977.0),
            0.8,
            "src-b",
            Uuid::new_v4(),
        ) else {
            panic!("expected dispute");
        };
        b.resolve_manual(conflict_id, &AttrValue::Number(1976.0), None)
            .unwrap();

        let reopened = b.reopen(conflict_id).unwrap();
        assert_ne!(reopened.id, conflict_id);
        assert_eq!(reopened.status, ConflictStatus::Disputed);
        assert_eq!(reopened.reopened_from, Some(conflict_id));
        // the original stays resolved
        assert_eq!(b.get(conflict_id).unwrap().status, ConflictStatus::Resolved);
        assert_eq!(b.open_count(), 1);
    }

    #[test]
    fn test_list_filters() {
        let mut b = book();
        let s1 = subject();
        let s2 = subject();
        b.evaluate(s1, "a", AttrValue::Number(1.0), 0.8, "src-a", Uuid::new_v4());
        b.evaluate(s1, "a", AttrValue::Number(2.0), 0.8, "src-b", Uuid::new_v4());
        b.evaluate(s2, "b", AttrValue::Number(1.0), 0.8, "src-a", Uuid::new_v4());
        b.evaluate(s2, "b", AttrValue::Number(2.0), 0.8, "src-b", Uuid::new_v4());

        assert_eq!(b.all_records().len(), 2);
        let filtered = b.list(&ConflictFilter {
            subject: Some(s1),
            ..Default::default()
        });
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].subject, s1);

        let disputed = b.list(&ConflictFilter {
            status: Some(ConflictStatus::Disputed),
            ..Default::default()
        });
        assert_eq!(disputed.len(), 2);
    }

    #[test]
    fn test_retarget_moves_history_to_winner() {
        let mut b = book();
        let winner = subject();
        let loser = subject();
        b.evaluate(loser, "founded_year", AttrValue::Number(1976.0), 0.8, "src-a", Uuid::new_v4());
        b.evaluate(loser, "founded_year", AttrValue::Number(1977.0), 0.8, "src-b", Uuid::new_v4());
        assert_eq!(b.open_count(), 1);

        let changed = b.retarget(winner, &[loser]);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].subject, winner);
        let records = b.list(&ConflictFilter {
            subject: Some(winner),
            ..Default::default()
        });
        assert_eq!(records.len(), 1);

        // corroboration after the merge still counts the pre-merge sources
        let eval = b.evaluate(
            winner,
            "founded_year",
            AttrValue::Number(1976.0),
            0.8,
            "src-c",
            Uuid::new_v4(),
        );
        assert!(matches!(eval, Evaluation::Accepted { .. }));
    }

    #[test]
    fn test_retargeted_slot_displacement_leaves_record() {
        let mut b = book();
        let winner = subject();
        let loser = subject();
        // the loser's only value was accepted without opposition
        b.evaluate(loser, "hq", AttrValue::Text("austin".into()), 0.7, "src-a", Uuid::new_v4());
        b.retarget(winner, &[loser]);
        // the caller mirrors the graph's post-merge slot value
        b.set_accepted(winner, "hq", Some("s:austin".to_string()));

        let eval = b.evaluate(
            winner,
            "hq",
            AttrValue::Text("berlin".into()),
            0.9,
            "src-b",
            Uuid::new_v4(),
        );
        match eval {
            Evaluation::Accepted {
                value,
                previous,
                record,
                ..
            } => {
                assert_eq!(value, AttrValue::Text("berlin".into()));
                // the folded value is displaced, not silently forgotten
                assert_eq!(previous, Some(AttrValue::Text("austin".into())));
                let record = b.get(record.unwrap()).unwrap();
                assert_eq!(record.status, ConflictStatus::Resolved);
                assert_eq!(record.accepted_key.as_deref(), Some("s:berlin"));
                assert_eq!(record.competing.len(), 2);
            }
            other => panic!("expected displacement, got {:?}", other),
        }
    }

    #[test]
    fn test_restore_resolves_subjects_through_merges() {
        use crate::ledger::{Assertion, ProvenanceLedger};

        let mut graph = CanonicalGraph::new();
        let winner_id = graph.create_entity("ORG", "apple co", 0.9, 1);
        let loser_id = graph.create_entity("ORG", "apple inc", 0.8, 2);
        graph.apply_merge(winner_id, &[loser_id]).unwrap();

        // evidence and a settled record written before the merge carry the
        // absorbed entity's id
        let ledger = ProvenanceLedger::new();
        let entry = ledger.append(Assertion::new(
            SubjectId::Entity(loser_id),
            "src-a",
            0.7,
            "ner-v1",
            LedgerOp::AttributeAsserted {
                attribute: "hq".to_string(),
                value: AttrValue::Text("austin".into()),
            },
        ));
        let stale = ConflictRecord {
            id: Uuid::new_v4(),
            subject: SubjectId::Entity(loser_id),
            attribute: "hq".to_string(),
            status: ConflictStatus::Resolved,
            competing: Vec::new(),
            accepted_key: Some("s:austin".to_string()),
            resolution_method: Some(ResolutionMethod::Margin),
            opened_at: Utc::now(),
            resolved_at: Some(Utc::now()),
            resolution_note: None,
            reopened_from: None,
        };
        let stale_id = stale.id;

        let mut b = book();
        b.restore(&graph, &[entry], vec![stale]);
        let records = b.list(&ConflictFilter {
            subject: Some(SubjectId::Entity(winner_id)),
            ..Default::default()
        });
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, stale_id);

        b.set_accepted(
            SubjectId::Entity(winner_id),
            "hq",
            Some("s:austin".to_string()),
        );
        // a tied counter-assertion weighs against the folded evidence and
        // disputes instead of replacing it
        let eval = b.evaluate(
            SubjectId::Entity(winner_id),
            "hq",
            AttrValue::Text("berlin".into()),
            0.7,
            "src-b",
            Uuid::new_v4(),
        );
        assert!(matches!(eval, Evaluation::Disputed { opened: true, .. }));
        assert_eq!(b.open_count(), 1);
    }
}
