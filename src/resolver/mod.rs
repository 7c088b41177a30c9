//! Incremental entity resolution: blocking, composite similarity, and the
//! attach / merge / create decision for each entity mention.
//!
//! Resolution is decision-only. The resolver never mutates the graph; the
//! engine executes the returned decision so that ledger writes, merges, and
//! persistence stay in one place.

pub mod blocking;
mod similarity;

pub use blocking::{BlockIndex, BlockKey};
pub use similarity::{CompositeScorer, SimilarityScorer};

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::config::ResolverConfig;
use crate::graph::CanonicalGraph;
use crate::model::{AttrValue, EntityId};
use crate::resolver::blocking::Normalizer;

/// What to do with an entity mention.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionDecision {
    /// No candidate reached the ambiguous band; mint a new entity.
    CreateNew,
    /// Attach to an existing entity. `tentative` marks the ambiguous band.
    Attach {
        entity_id: EntityId,
        score: f64,
        tentative: bool,
    },
    /// Several candidates cleared the merge threshold: attach to the first
    /// element (the oldest entity) and fold the rest into it.
    Merge { group: Vec<EntityId>, score: f64 },
}

pub struct EntityResolver {
    config: ResolverConfig,
    scorer: Box<dyn SimilarityScorer>,
    index: BlockIndex,
    normalizer: Normalizer,
}

impl EntityResolver {
    pub fn new(config: ResolverConfig) -> Self {
        let scorer = CompositeScorer::new(config.value_weight, config.attribute_weight);
        Self::with_scorer(config, Box::new(scorer))
    }

    pub fn with_scorer(config: ResolverConfig, scorer: Box<dyn SimilarityScorer>) -> Self {
        Self {
            config,
            scorer,
            index: BlockIndex::new(),
            normalizer: Normalizer::new(),
        }
    }

    /// Blocking keys for a surface form. Also used by the engine to pick
    /// which block locks a mention needs.
    pub fn block_keys(&self, entity_type: &str, value: &str) -> Vec<BlockKey> {
        let normalized = self.normalizer.normalize(value);
        blocking::keys_for(entity_type, &normalized, self.config.blocking_prefix_len)
    }

    /// Index an entity under the blocks of one of its surface forms. Called
    /// on creation and whenever a new alias is observed. Stale postings left
    /// behind by merges are collapsed through redirects at query time.
    pub fn index_entity(&mut self, id: EntityId, entity_type: &str, value: &str) {
        let keys = self.block_keys(entity_type, value);
        self.index.insert(&keys, id);
    }

    /// Drop and rebuild the block index from a restored graph.
    pub fn rebuild_from(&mut self, graph: &CanonicalGraph) {
        self.index = BlockIndex::new();
        for entity in graph.live_entities() {
            for form in entity.surface_forms() {
                let keys = self.block_keys(&entity.entity_type, form);
                self.index.insert(&keys, entity.id);
            }
        }
        log::debug!(
            "rebuilt block index: {} blocks, {} postings",
            self.index.block_count(),
            self.index.posting_count()
        );
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    /// Decide where an entity mention belongs.
    pub fn resolve(
        &self,
        entity_type: &str,
        value: &str,
        attributes: &BTreeMap<String, AttrValue>,
        graph: &CanonicalGraph,
    ) -> ResolutionDecision {
        let keys = self.block_keys(entity_type, value);
        let mut candidates: Vec<EntityId> = self
            .index
            .candidates(&keys)
            .into_iter()
            .filter_map(|id| graph.resolve_id(id))
            .collect();
        candidates.sort();
        candidates.dedup();
        if candidates.len() > self.config.max_block_candidates {
            log::debug!(
                "block for '{}' has {} candidates, scoring first {}",
                value,
                candidates.len(),
                self.config.max_block_candidates
            );
            candidates.truncate(self.config.max_block_candidates);
        }

        let mut scored: Vec<(f64, u64, EntityId)> = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Some(entity) = graph.entity_unresolved(id) else {
                continue;
            };
            let score = self.scorer.score(entity_type, value, attributes, entity);
            scored.push((score, entity.created_seq, id));
        }
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        let Some(&(best_score, _, best_id)) = scored.first() else {
            return ResolutionDecision::CreateNew;
        };

        if best_score >= self.config.merge_threshold {
            let mut group: Vec<(u64, EntityId)> = scored
                .iter()
                .filter(|(score, _, _)| *score >= self.config.merge_threshold)
                .map(|(_, seq, id)| (*seq, *id))
                .collect();
            group.sort();
            if group.len() == 1 {
                ResolutionDecision::Attach {
                    entity_id: best_id,
                    score: best_score,
                    tentative: false,
                }
            } else {
                ResolutionDecision::Merge {
                    group: group.into_iter().map(|(_, id)| id).collect(),
                    score: best_score,
                }
            }
        } else if best_score >= self.config.ambiguous_low {
            ResolutionDecision::Attach {
                entity_id: best_id,
                score: best_score,
                tentative: true,
            }
        } else {
            ResolutionDecision::CreateNew
        }
    }
}
