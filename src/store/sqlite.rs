//! SQLite backend: a connection manager plus the `GraphStore` implementation.
//!
//! rusqlite is synchronous, so every statement runs inside
//! `tokio::task::spawn_blocking`. Records are stored whole as JSON payloads;
//! the extracted columns only serve filtered queries.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::task;

use crate::conflict::ConflictRecord;
use crate::error::{GraphweldError, Result};
use crate::graph::{CanonicalEntity, CanonicalRelationship};
use crate::ledger::LedgerEntry;
use crate::store::{migrate, GraphStore};

/// Connection manager. Each operation opens a fresh connection with the
/// standard pragma set; SQLite in WAL mode handles the rest.
pub struct Db {
    path: PathBuf,
}

const PRAGMAS: &str = "PRAGMA journal_mode = WAL; \
     PRAGMA synchronous = NORMAL; \
     PRAGMA foreign_keys = ON; \
     PRAGMA temp_store = MEMORY; \
     PRAGMA cache_size = -65536; \
     PRAGMA mmap_size = 268435456; \
     PRAGMA wal_autocheckpoint = 1000;";

impl Db {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            path: db_path.as_ref().to_path_buf(),
        }
    }

    pub fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(PRAGMAS)?;
        Ok(conn)
    }

    /// Run a closure against a connection on the blocking pool.
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)?;
            conn.execute_batch(PRAGMAS)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| GraphweldError::StoreUnavailable(format!("blocking task failed: {}", e)))?
    }
}

/// Durable store backed by SQLite.
pub struct SqliteStore {
    db: Db,
}

impl SqliteStore {
    /// Open the database and bring the schema up to date.
    pub async fn open(db_path: &Path, migrations_dir: &Path) -> Result<Self> {
        let db = Db::new(db_path);
        let dir = migrations_dir.to_path_buf();
        db.with_connection(move |conn| migrate::run_migrations(conn, &dir))
            .await?;
        log::info!("opened sqlite store at {}", db_path.display());
        Ok(Self { db })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }
}

fn rows_to_payloads<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    query: &str,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(query)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(serde_json::from_str(&row?)?);
    }
    Ok(out)
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn append_ledger(&self, entry: &LedgerEntry) -> Result<()> {
        let entry = entry.clone();
        self.db
            .with_connection(move |conn| {
                let payload = serde_json::to_string(&entry)?;
                let (subject_kind, subject_id) = match entry.subject {
                    crate::model::SubjectId::Entity(id) => ("entity", id.to_string()),
                    crate::model::SubjectId::Relationship(id) => {
                        ("relationship", id.to_string())
                    }
                };
                conn.execute(
                    "INSERT INTO ledger_entries \
                     (seq, assertion_id, subject_kind, subject_id, source_id, confidence, \
                      extraction_method, timestamp, supersedes, op, payload) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                     ON CONFLICT(seq) DO NOTHING",
                    params![
                        entry.seq,
                        entry.assertion_id.to_string(),
                        subject_kind,
                        subject_id,
                        entry.source_id,
                        entry.confidence,
                        entry.extraction_method,
                        entry.timestamp.to_rfc3339(),
                        entry.supersedes.map(|id| id.to_string()),
                        entry.op.name(),
                        payload,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn load_ledger(&self) -> Result<Vec<LedgerEntry>> {
        self.db
            .with_connection(|conn| {
                rows_to_payloads(
                    conn,
                    "SELECT payload FROM ledger_entries ORDER BY timestamp, seq",
                )
            })
            .await
    }

    async fn save_entity(&self, entity: &CanonicalEntity) -> Result<()> {
        let entity = entity.clone();
        self.db
            .with_connection(move |conn| {
                let payload = serde_json::to_string(&entity)?;
                conn.execute(
                    "INSERT INTO entities (entity_id, entity_type, value, revision, merged_into, payload) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(entity_id) DO UPDATE SET \
                       entity_type = excluded.entity_type, \
                       value = excluded.value, \
                       revision = excluded.revision, \
                       merged_into = excluded.merged_into, \
                       payload = excluded.payload",
                    params![
                        entity.id.to_string(),
                        entity.entity_type,
                        entity.value,
                        entity.revision,
                        entity.merged_into.map(|id| id.to_string()),
                        payload,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn load_entities(&self) -> Result<Vec<CanonicalEntity>> {
        self.db
            .with_connection(|conn| {
                rows_to_payloads(conn, "SELECT payload FROM entities ORDER BY entity_id")
            })
            .await
    }

    async fn save_relationship(&self, rel: &CanonicalRelationship) -> Result<()> {
        let rel = rel.clone();
        self.db
            .with_connection(move |conn| {
                let payload = serde_json::to_string(&rel)?;
                conn.execute(
                    "INSERT INTO relationships \
                     (relationship_id, rel_type, source_id, target_id, revision, payload) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(relationship_id) DO UPDATE SET \
                       rel_type = excluded.rel_type, \
                       source_id = excluded.source_id, \
                       target_id = excluded.target_id, \
                       revision = excluded.revision, \
                       payload = excluded.payload",
                    params![
                        rel.id.to_string(),
                        rel.rel_type,
                        rel.source.to_string(),
                        rel.target.to_string(),
                        rel.revision,
                        payload,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn load_relationships(&self) -> Result<Vec<CanonicalRelationship>> {
        self.db
            .with_connection(|conn| {
                rows_to_payloads(
                    conn,
                    "SELECT payload FROM relationships ORDER BY relationship_id",
                )
            })
            .await
    }

    async fn save_conflict(&self, record: &ConflictRecord) -> Result<()> {
        let record = record.clone();
        self.db
            .with_connection(move |conn| {
                let payload = serde_json::to_string(&record)?;
                let (subject_kind, subject_id) = match record.subject {
                    crate::model::SubjectId::Entity(id) => ("entity", id.to_string()),
                    crate::model::SubjectId::Relationship(id) => {
                        ("relationship", id.to_string())
                    }
                };
                conn.execute(
                    "INSERT INTO conflicts \
                     (conflict_id, subject_kind, subject_id, attribute, status, opened_at, payload) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(conflict_id) DO UPDATE SET \
                       subject_kind = excluded.subject_kind, \
                       subject_id = excluded.subject_id, \
                       status = excluded.status, \
                       payload = excluded.payload",
                    params![
                        record.id.to_string(),
                        subject_kind,
                        subject_id,
                        record.attribute,
                        record.status.to_string(),
                        record.opened_at.to_rfc3339(),
                        payload,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn load_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.db
            .with_connection(|conn| {
                rows_to_payloads(
                    conn,
                    "SELECT payload FROM conflicts ORDER BY opened_at, conflict_id",
                )
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::CanonicalGraph;
    use crate::ledger::{Assertion, LedgerOp, ProvenanceLedger};
    use crate::model::SubjectId;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn open_store() -> (SqliteStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("test.db");
        let migrations = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        let store = SqliteStore::open(&db_path, &migrations).await.unwrap();
        (store, temp)
    }

    #[tokio::test]
    async fn test_ledger_round_trip() {
        let (store, _temp) = open_store().await;
        let ledger = ProvenanceLedger::new();
        let entry = ledger.append(Assertion::new(
            SubjectId::Entity(Uuid::new_v4()),
            "src-a",
            0.9,
            "ner-v1",
            LedgerOp::EntityCreated {
                entity_type: "ORG".to_string(),
                value: "apple".to_string(),
            },
        ));
        store.append_ledger(&entry).await.unwrap();
        // retried append must not duplicate
        store.append_ledger(&entry).await.unwrap();

        let loaded = store.load_ledger().await.unwrap();
        assert_eq!(loaded, vec![entry]);
    }

    #[tokio::test]
    async fn test_entity_and_relationship_round_trip() {
        let (store, _temp) = open_store().await;
        let mut graph = CanonicalGraph::new();
        let a = graph.create_entity("ORG", "apple", 0.9, 1);
        let b = graph.create_entity("PERSON", "steve jobs", 0.95, 2);
        let (rel_id, _) = graph.upsert_relationship("founded_by", a, b, 0.9, 3).unwrap();

        for id in [a, b] {
            store.save_entity(graph.entity(id).unwrap()).await.unwrap();
        }
        store
            .save_relationship(graph.relationship(rel_id).unwrap())
            .await
            .unwrap();

        let entities = store.load_entities().await.unwrap();
        assert_eq!(entities.len(), 2);
        let rels = store.load_relationships().await.unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].rel_type, "founded_by");
        assert_eq!(rels[0].merged_into, None);

        // a folded edge persists as a redirect row, not a deletion
        let mut tomb = rels[0].clone();
        tomb.merged_into = Some(Uuid::new_v4());
        store.save_relationship(&tomb).await.unwrap();
        let rels = store.load_relationships().await.unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].merged_into, tomb.merged_into);
    }

    #[tokio::test]
    async fn test_entity_upsert_overwrites() {
        let (store, _temp) = open_store().await;
        let mut graph = CanonicalGraph::new();
        let a = graph.create_entity("ORG", "apple", 0.9, 1);
        store.save_entity(graph.entity(a).unwrap()).await.unwrap();

        graph.observe_surface_form(a, "apple inc", 0.95).unwrap();
        store.save_entity(graph.entity(a).unwrap()).await.unwrap();

        let loaded = store.load_entities().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].value, "apple inc");
        assert!(loaded[0].aliases.contains("apple"));
    }

    #[tokio::test]
    async fn test_conflict_status_update_persists() {
        let (store, _temp) = open_store().await;
        let config = crate::config::ConflictConfig::default();
        let mut book = crate::conflict::ConflictBook::new(&config);
        let subject = SubjectId::Entity(Uuid::new_v4());
        book.evaluate(
            subject,
            "founded_year",
            crate::model::AttrValue::Number(1976.0),
            0.8,
            "src-a",
            Uuid::new_v4(),
        );
        let crate::conflict::Evaluation::Disputed { conflict_id, .. } = book.evaluate(
            subject,
            "founded_year",
            crate::model::AttrValue::Number(1977.0),
            0.8,
            "src-b",
            Uuid::new_v4(),
        ) else {
            panic!("expected dispute");
        };
        let record = book.get(conflict_id).unwrap().clone();
        store.save_conflict(&record).await.unwrap();

        let resolved = book
            .resolve_manual(conflict_id, &crate::model::AttrValue::Number(1976.0), None)
            .unwrap();
        store.save_conflict(&resolved).await.unwrap();

        let loaded = store.load_conflicts().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, crate::conflict::ConflictStatus::Resolved);
    }
}
