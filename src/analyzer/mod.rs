//! Centrality measures over the canonical graph.
//!
//! All measures treat the graph as undirected and count distinct neighbors,
//! so parallel relationship types between the same pair contribute once.
//! Iteration follows sorted entity ids, which makes every ranking
//! deterministic for a given graph revision. Results are cached per
//! `(revision, measure)`; a mutation bumps the revision, so stale entries
//! are never served and age out of the cache lazily.

mod cache;

pub use cache::CentralityCache;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::GraphweldError;
use crate::graph::CanonicalGraph;
use crate::model::EntityId;

/// Entities ranked by score, highest first; ties broken by id.
pub type CentralityRanking = Vec<(EntityId, f64)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    Degree,
    Closeness,
    Betweenness,
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measure::Degree => write!(f, "degree"),
            Measure::Closeness => write!(f, "closeness"),
            Measure::Betweenness => write!(f, "betweenness"),
        }
    }
}

impl FromStr for Measure {
    type Err = GraphweldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "degree" => Ok(Measure::Degree),
            "closeness" => Ok(Measure::Closeness),
            "betweenness" => Ok(Measure::Betweenness),
            other => Err(GraphweldError::Validation(format!(
                "unknown centrality measure '{}'",
                other
            ))),
        }
    }
}

pub struct GraphAnalyzer {
    cache: CentralityCache,
}

impl GraphAnalyzer {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: CentralityCache::new(cache_capacity),
        }
    }

    /// Ranking for a measure at the graph's current revision.
    pub fn centrality(&self, graph: &CanonicalGraph, measure: Measure) -> Arc<CentralityRanking> {
        let revision = graph.revision();
        if let Some(hit) = self.cache.get(revision, measure) {
            log::debug!("centrality cache hit: {} @ rev {}", measure, revision);
            return hit;
        }
        self.ranking(revision, &graph.adjacency(), measure)
    }

    /// Ranking over a prepared adjacency view. Lets the engine copy the
    /// adjacency out of its lock and run the measure without holding it.
    pub fn ranking(
        &self,
        revision: u64,
        adjacency: &BTreeMap<EntityId, BTreeSet<EntityId>>,
        measure: Measure,
    ) -> Arc<CentralityRanking> {
        if let Some(hit) = self.cache.get(revision, measure) {
            log::debug!("centrality cache hit: {} @ rev {}", measure, revision);
            return hit;
        }
        let scores = match measure {
            Measure::Degree => degree(adjacency),
            Measure::Closeness => closeness(adjacency),
            Measure::Betweenness => betweenness(adjacency),
        };
        let ranking = Arc::new(rank(scores));
        self.cache.put(revision, measure, Arc::clone(&ranking));
        log::debug!(
            "computed {} centrality for {} entities @ rev {}",
            measure,
            ranking.len(),
            revision
        );
        ranking
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

fn rank(scores: BTreeMap<EntityId, f64>) -> CentralityRanking {
    let mut ranking: Vec<(EntityId, f64)> = scores.into_iter().collect();
    ranking.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    ranking
}

/// Degree centrality: distinct neighbors over `n - 1`.
fn degree(adjacency: &BTreeMap<EntityId, BTreeSet<EntityId>>) -> BTreeMap<EntityId, f64> {
    let n = adjacency.len();
    adjacency
        .iter()
        .map(|(id, neighbors)| {
            let score = if n <= 1 {
                0.0
            } else {
                neighbors.len() as f64 / (n - 1) as f64
            };
            (*id, score)
        })
        .collect()
}

fn bfs_distances(
    adjacency: &BTreeMap<EntityId, BTreeSet<EntityId>>,
    start: EntityId,
) -> HashMap<EntityId, usize> {
    let mut dist = HashMap::new();
    let mut queue = VecDeque::new();
    dist.insert(start, 0usize);
    queue.push_back(start);
    while let Some(node) = queue.pop_front() {
        let d = dist[&node];
        if let Some(neighbors) = adjacency.get(&node) {
            for next in neighbors {
                if !dist.contains_key(next) {
                    dist.insert(*next, d + 1);
                    queue.push_back(*next);
                }
            }
        }
    }
    dist
}

/// Closeness centrality with the component-size correction, so scores stay
/// comparable across a disconnected graph: `(r / sum_d) * (r / (n - 1))`
/// where `r` is the number of other reachable entities.
fn closeness(adjacency: &BTreeMap<EntityId, BTreeSet<EntityId>>) -> BTreeMap<EntityId, f64> {
    let n = adjacency.len();
    let mut scores = BTreeMap::new();
    for id in adjacency.keys() {
        let dist = bfs_distances(adjacency, *id);
        let reachable = dist.len().saturating_sub(1);
        let sum: usize = dist.values().sum();
        let score = if reachable == 0 || sum == 0 || n <= 1 {
            0.0
        } else {
            (reachable as f64 / sum as f64) * (reachable as f64 / (n - 1) as f64)
        };
        scores.insert(*id, score);
    }
    scores
}

/// Betweenness centrality via Brandes' accumulation, normalized by
/// `2 / ((n - 1)(n - 2))` for the undirected case.
fn betweenness(adjacency: &BTreeMap<EntityId, BTreeSet<EntityId>>) -> BTreeMap<EntityId, f64> {
    let ids: Vec<EntityId> = adjacency.keys().copied().collect();
    let n = ids.len();
    if n <= 2 {
        return ids.iter().map(|id| (*id, 0.0)).collect();
    }
    let pos: HashMap<EntityId, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let neighbors: Vec<Vec<usize>> = ids
        .iter()
        .map(|id| adjacency[id].iter().map(|other| pos[other]).collect())
        .collect();

    let mut acc = vec![0.0f64; n];
    for s in 0..n {
        // single-source shortest paths, unweighted
        let mut stack: Vec<usize> = Vec::with_capacity(n);
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut sigma = vec![0.0f64; n];
        let mut dist = vec![-1i64; n];
        sigma[s] = 1.0;
        dist[s] = 0;
        let mut queue = VecDeque::new();
        queue.push_back(s);
        while let Some(v) = queue.pop_front() {
            stack.push(v);
            for &w in &neighbors[v] {
                if dist[w] < 0 {
                    dist[w] = dist[v] + 1;
                    queue.push_back(w);
                }
                if dist[w] == dist[v] + 1 {
                    sigma[w] += sigma[v];
                    preds[w].push(v);
                }
            }
        }
        // dependency accumulation
        let mut delta = vec![0.0f64; n];
        while let Some(w) = stack.pop() {
            for &v in &preds[w] {
                delta[v] += (sigma[v] / sigma[w]) * (1.0 + delta[w]);
            }
            if w != s {
                acc[w] += delta[w];
            }
        }
    }

    // each unordered pair was accumulated from both endpoints
    let norm = ((n - 1) * (n - 2)) as f64;
    ids.iter()
        .enumerate()
        .map(|(i, id)| (*id, acc[i] / norm))
        .collect()
}
