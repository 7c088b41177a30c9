//! Append-only provenance ledger.
//!
//! Every accepted assertion lands here before any canonical structure is
//! touched, including assertions that lose conflict resolution. Entries are
//! never updated or deleted; corrections arrive as new entries whose
//! `supersedes` field points at the prior assertion. Sequence numbers come
//! from an atomic counter and timestamps are stamped at append time, so the
//! `(timestamp, seq)` pair gives a stable total order for replay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{AttrValue, EntityId, MentionId, SubjectId};

/// Assertion identifier, unique per ledger entry.
pub type AssertionId = Uuid;

/// What a ledger entry did to the canonical graph. Carries enough payload to
/// rebuild the graph by replaying entries in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOp {
    EntityCreated {
        entity_type: String,
        value: String,
    },
    RelationshipCreated {
        rel_type: String,
        source: EntityId,
        target: EntityId,
    },
    MentionAttached {
        mention_id: MentionId,
        fingerprint: String,
        tentative: bool,
        /// Surface form observed for entity subjects; `None` for
        /// relationship subjects.
        surface: Option<String>,
    },
    AttributeAsserted {
        attribute: String,
        value: AttrValue,
    },
    /// Entities folded into a survivor. Logged once per merge; the absorbed
    /// entities' own history stays under their original subject ids.
    Merged {
        absorbed: Vec<EntityId>,
    },
    /// An operator reopened a settled dispute on this subject's attribute.
    ConflictReopened {
        conflict_id: Uuid,
        attribute: String,
    },
}

impl LedgerOp {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerOp::EntityCreated { .. } => "entity_created",
            LedgerOp::RelationshipCreated { .. } => "relationship_created",
            LedgerOp::MentionAttached { .. } => "mention_attached",
            LedgerOp::AttributeAsserted { .. } => "attribute_asserted",
            LedgerOp::Merged { .. } => "merged",
            LedgerOp::ConflictReopened { .. } => "conflict_reopened",
        }
    }
}

/// One immutable ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub assertion_id: AssertionId,
    pub subject: SubjectId,
    pub source_id: String,
    pub confidence: f64,
    pub extraction_method: String,
    pub timestamp: DateTime<Utc>,
    /// Prior assertion this one corrects, if any
    pub supersedes: Option<AssertionId>,
    pub op: LedgerOp,
}

/// Fields the engine supplies; the ledger fills in seq, id, and timestamp.
#[derive(Debug, Clone)]
pub struct Assertion {
    pub subject: SubjectId,
    pub source_id: String,
    pub confidence: f64,
    pub extraction_method: String,
    pub supersedes: Option<AssertionId>,
    pub op: LedgerOp,
}

impl Assertion {
    pub fn new(
        subject: SubjectId,
        source_id: impl Into<String>,
        confidence: f64,
        extraction_method: impl Into<String>,
        op: LedgerOp,
    ) -> Self {
        Self {
            subject,
            source_id: source_id.into(),
            confidence,
            extraction_method: extraction_method.into(),
            supersedes: None,
            op,
        }
    }

    #[must_use]
    pub fn superseding(mut self, prior: AssertionId) -> Self {
        self.supersedes = Some(prior);
        self
    }
}

/// Thread-safe append-only log of assertions.
pub struct ProvenanceLedger {
    entries: Mutex<Vec<LedgerEntry>>,
    next_seq: AtomicU64,
}

impl ProvenanceLedger {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Rebuild from persisted entries, continuing the sequence where the
    /// stored log left off.
    pub fn from_entries(mut entries: Vec<LedgerEntry>) -> Self {
        entries.sort_by(|a, b| (a.timestamp, a.seq).cmp(&(b.timestamp, b.seq)));
        let next = entries.iter().map(|e| e.seq).max().unwrap_or(0) + 1;
        Self {
            entries: Mutex::new(entries),
            next_seq: AtomicU64::new(next),
        }
    }

    /// Append an assertion, stamping sequence number and timestamp. Returns
    /// the completed entry for persistence and logging.
    pub fn append(&self, assertion: Assertion) -> LedgerEntry {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = LedgerEntry {
            seq,
            assertion_id: Uuid::new_v4(),
            subject: assertion.subject,
            source_id: assertion.source_id,
            confidence: assertion.confidence,
            extraction_method: assertion.extraction_method,
            timestamp: Utc::now(),
            supersedes: assertion.supersedes,
            op: assertion.op,
        };
        self.entries.lock().unwrap().push(entry.clone());
        log::debug!(
            "ledger seq={} {} subject={} source={}",
            entry.seq,
            entry.op.name(),
            entry.subject,
            entry.source_id
        );
        entry
    }

    /// All entries in `(timestamp, seq)` order.
    pub fn all_entries(&self) -> Vec<LedgerEntry> {
        let mut entries = self.entries.lock().unwrap().clone();
        entries.sort_by(|a, b| (a.timestamp, a.seq).cmp(&(b.timestamp, b.seq)));
        entries
    }

    /// Entries whose subject is any of the given ids, in `(timestamp, seq)`
    /// order. Callers pass the full redirect chain of a merged entity to see
    /// its complete history.
    pub fn entries_for(&self, subjects: &[SubjectId]) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| subjects.contains(&e.subject))
            .cloned()
            .collect();
        entries.sort_by(|a, b| (a.timestamp, a.seq).cmp(&(b.timestamp, b.seq)));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl Default for ProvenanceLedger {
    fn default() -> Self {
        Self::new()
    }
}
