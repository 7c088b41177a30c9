//! Composite similarity between a mention and a candidate entity.

use std::collections::BTreeMap;

use strsim::jaro_winkler;

use crate::graph::CanonicalEntity;
use crate::model::AttrValue;
use crate::resolver::blocking::Normalizer;

/// Scores a mention against a candidate. Implementations must return values
/// in [0, 1], with 0 meaning "cannot be the same entity".
pub trait SimilarityScorer: Send + Sync {
    fn score(
        &self,
        entity_type: &str,
        value: &str,
        attributes: &BTreeMap<String, AttrValue>,
        candidate: &CanonicalEntity,
    ) -> f64;
}

/// Default scorer: Jaro-Winkler over surface forms blended with attribute
/// overlap, gated on entity type.
pub struct CompositeScorer {
    value_weight: f64,
    attribute_weight: f64,
    normalizer: Normalizer,
}

impl CompositeScorer {
    pub fn new(value_weight: f64, attribute_weight: f64) -> Self {
        Self {
            value_weight,
            attribute_weight,
            normalizer: Normalizer::new(),
        }
    }

    fn name_score(&self, value: &str, candidate: &CanonicalEntity) -> f64 {
        let needle = self.normalizer.normalize(value);
        candidate
            .surface_forms()
            .map(|form| jaro_winkler(&needle, &self.normalizer.normalize(form)))
            .fold(0.0, f64::max)
    }

    /// Fraction of shared attribute keys whose values agree. `None` when the
    /// mention and candidate share no keys.
    fn attribute_overlap(
        &self,
        attributes: &BTreeMap<String, AttrValue>,
        candidate: &CanonicalEntity,
    ) -> Option<f64> {
        let mut shared = 0usize;
        let mut matching = 0usize;
        for (key, value) in attributes {
            let Some(slot) = candidate.attributes.get(key) else {
                continue;
            };
            let Some(existing) = &slot.value else {
                continue;
            };
            shared += 1;
            if existing.canonical_key() == value.canonical_key() {
                matching += 1;
            }
        }
        if shared == 0 {
            None
        } else {
            Some(matching as f64 / shared as f64)
        }
    }
}

impl SimilarityScorer for CompositeScorer {
    fn score(
        &self,
        entity_type: &str,
        value: &str,
        attributes: &BTreeMap<String, AttrValue>,
        candidate: &CanonicalEntity,
    ) -> f64 {
        // different types never merge
        if candidate.entity_type != entity_type {
            return 0.0;
        }
        let name = self.name_score(value, candidate);
        match self.attribute_overlap(attributes, candidate) {
            Some(overlap) => self.value_weight * name + self.attribute_weight * overlap,
            None => name,
        }
    }
}
