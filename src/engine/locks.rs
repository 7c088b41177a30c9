//! Ordered lock acquisition for concurrent batch submission.
//!
//! Each mention holds two kinds of locks while it runs: block locks covering
//! the candidate space its surface forms hash into, and entity locks covering
//! the specific entities its decision touches. Both sets are acquired in
//! sorted order, so two submitters can never hold pieces of each other's set
//! and deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::EntityId;
use crate::resolver::BlockKey;

pub struct LockManager {
    blocks: Mutex<HashMap<BlockKey, Arc<AsyncMutex<()>>>>,
    entities: Mutex<HashMap<EntityId, Arc<AsyncMutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            entities: Mutex::new(HashMap::new()),
        }
    }

    /// Lock a set of blocks. Keys are sorted and deduplicated first; guards
    /// release on drop.
    pub async fn lock_blocks(&self, keys: &[BlockKey]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<BlockKey> = keys.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            let lock = {
                let mut registry = self.blocks.lock().unwrap();
                registry
                    .entry(key)
                    .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                    .clone()
            };
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    /// Lock a set of entities in ascending id order.
    pub async fn lock_entities(&self, ids: &[EntityId]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<EntityId> = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            let lock = {
                let mut registry = self.entities.lock().unwrap();
                registry
                    .entry(id)
                    .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                    .clone()
            };
            guards.push(lock.lock_owned().await);
        }
        guards
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
