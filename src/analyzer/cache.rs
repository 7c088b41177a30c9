//! LRU cache for centrality results, keyed by graph revision and measure.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::analyzer::{CentralityRanking, Measure};

/// Thread-safe LRU cache of computed rankings.
///
/// Keys include the graph revision, so stale results are never returned;
/// entries for old revisions simply age out.
pub struct CentralityCache {
    cache: Mutex<LruCache<(u64, Measure), Arc<CentralityRanking>>>,
}

impl CentralityCache {
    /// Create a cache holding up to `capacity` rankings.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("Cache capacity must be at least 1");
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, revision: u64, measure: Measure) -> Option<Arc<CentralityRanking>> {
        self.cache.lock().unwrap().get(&(revision, measure)).cloned()
    }

    pub fn put(&self, revision: u64, measure: Measure, ranking: Arc<CentralityRanking>) {
        self.cache.lock().unwrap().put((revision, measure), ranking);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }
}
