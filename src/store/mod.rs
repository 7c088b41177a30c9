//! Persistence behind the engine.
//!
//! `GraphStore` is the seam: the engine writes ledger entries before applying
//! anything in memory, then saves the touched canonical records. `MemoryStore`
//! backs tests and ephemeral runs; `SqliteStore` is the durable backend.

pub mod migrate;
mod sqlite;

pub use sqlite::{Db, SqliteStore};

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::conflict::{ConflictId, ConflictRecord};
use crate::error::Result;
use crate::graph::{CanonicalEntity, CanonicalRelationship};
use crate::ledger::LedgerEntry;
use crate::model::{EntityId, RelationshipId};

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Persist a ledger entry. Must be idempotent on `seq` so retried
    /// batches never duplicate history.
    async fn append_ledger(&self, entry: &LedgerEntry) -> Result<()>;
    async fn load_ledger(&self) -> Result<Vec<LedgerEntry>>;

    async fn save_entity(&self, entity: &CanonicalEntity) -> Result<()>;
    async fn load_entities(&self) -> Result<Vec<CanonicalEntity>>;

    async fn save_relationship(&self, rel: &CanonicalRelationship) -> Result<()>;
    async fn load_relationships(&self) -> Result<Vec<CanonicalRelationship>>;

    async fn save_conflict(&self, record: &ConflictRecord) -> Result<()>;
    async fn load_conflicts(&self) -> Result<Vec<ConflictRecord>>;
}

/// In-memory store for tests and ephemeral engines.
#[derive(Default)]
pub struct MemoryStore {
    ledger: Mutex<Vec<LedgerEntry>>,
    entities: Mutex<HashMap<EntityId, CanonicalEntity>>,
    relationships: Mutex<HashMap<RelationshipId, CanonicalRelationship>>,
    conflicts: Mutex<HashMap<ConflictId, ConflictRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn append_ledger(&self, entry: &LedgerEntry) -> Result<()> {
        let mut ledger = self.ledger.lock().unwrap();
        if !ledger.iter().any(|e| e.seq == entry.seq) {
            ledger.push(entry.clone());
        }
        Ok(())
    }

    async fn load_ledger(&self) -> Result<Vec<LedgerEntry>> {
        let mut entries = self.ledger.lock().unwrap().clone();
        entries.sort_by(|a, b| (a.timestamp, a.seq).cmp(&(b.timestamp, b.seq)));
        Ok(entries)
    }

    async fn save_entity(&self, entity: &CanonicalEntity) -> Result<()> {
        self.entities
            .lock()
            .unwrap()
            .insert(entity.id, entity.clone());
        Ok(())
    }

    async fn load_entities(&self) -> Result<Vec<CanonicalEntity>> {
        let mut entities: Vec<CanonicalEntity> =
            self.entities.lock().unwrap().values().cloned().collect();
        entities.sort_by_key(|e| e.id);
        Ok(entities)
    }

    async fn save_relationship(&self, rel: &CanonicalRelationship) -> Result<()> {
        self.relationships
            .lock()
            .unwrap()
            .insert(rel.id, rel.clone());
        Ok(())
    }

    async fn load_relationships(&self) -> Result<Vec<CanonicalRelationship>> {
        let mut rels: Vec<CanonicalRelationship> = self
            .relationships
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        rels.sort_by_key(|r| r.id);
        Ok(rels)
    }

    async fn save_conflict(&self, record: &ConflictRecord) -> Result<()> {
        self.conflicts
            .lock()
            .unwrap()
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn load_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let mut records: Vec<ConflictRecord> =
            self.conflicts.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| (a.opened_at, a.id).cmp(&(b.opened_at, b.id)));
        Ok(records)
    }
}
