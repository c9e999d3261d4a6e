//! Semantic cache entry shared between the cache and the wire envelope

use crate::{age_hours, new_entity_id, Embedding, EntityId, NodeId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Age (in hours) over which an entry's score falls by a factor of e.
pub const CACHE_SCORE_AGE_SCALE_HOURS: f64 = 24.0;

/// A question→answer pair, produced locally or shared by a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticCacheEntry {
    pub id: EntityId,
    pub query: String,
    pub embedding: Option<Embedding>,
    pub answer: String,
    /// Quality score in [0, 1]
    pub quality: f64,
    pub source_node: NodeId,
    pub created_at: Timestamp,
    pub last_accessed: Timestamp,
    pub hit_count: u64,
}

impl SemanticCacheEntry {
    /// Create a new entry originating at `source_node`.
    pub fn new(
        query: impl Into<String>,
        answer: impl Into<String>,
        quality: f64,
        source_node: impl Into<NodeId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_entity_id(),
            query: query.into(),
            embedding: None,
            answer: answer.into(),
            quality: quality.clamp(0.0, 1.0),
            source_node: source_node.into(),
            created_at: now,
            last_accessed: now,
            hit_count: 0,
        }
    }

    /// Attach an embedding of the query.
    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// `quality × exp(-ageHours/24) × (1 + ln(hits+1)/10)` evaluated at `now`.
    pub fn effective_score_at(&self, now: Timestamp) -> f64 {
        let age = age_hours(self.created_at, now);
        let freshness = (-age / CACHE_SCORE_AGE_SCALE_HOURS).exp();
        let popularity = 1.0 + ((self.hit_count as f64) + 1.0).ln() / 10.0;
        self.quality * freshness * popularity
    }

    /// Effective score right now.
    pub fn effective_score(&self) -> f64 {
        self.effective_score_at(Utc::now())
    }

    /// Record a cache hit.
    pub fn record_hit(&mut self, now: Timestamp) {
        self.hit_count = self.hit_count.saturating_add(1);
        self.last_accessed = now;
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry_with(age_hours: i64, hits: u64) -> (SemanticCacheEntry, Timestamp) {
        let now = Utc::now();
        let mut entry = SemanticCacheEntry::new("q", "a", 0.8, "self");
        entry.created_at = now - chrono::Duration::hours(age_hours);
        entry.hit_count = hits;
        (entry, now)
    }

    #[test]
    fn test_fresh_unused_entry_scores_its_quality() {
        let (entry, now) = entry_with(0, 0);
        assert!((entry.effective_score_at(now) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_record_hit_updates_counters() {
        let (mut entry, now) = entry_with(1, 0);
        entry.record_hit(now);
        assert_eq!(entry.hit_count, 1);
        assert_eq!(entry.last_accessed, now);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Effective score strictly decreases with age, all else equal.
        #[test]
        fn prop_score_decreases_with_age(age in 0i64..2000, extra in 1i64..500, hits in 0u64..10_000) {
            let (young, now) = entry_with(age, hits);
            let mut old = young.clone();
            old.created_at = young.created_at - chrono::Duration::hours(extra);
            prop_assert!(old.effective_score_at(now) < young.effective_score_at(now));
        }

        /// Effective score strictly increases with hit count, all else equal.
        #[test]
        fn prop_score_increases_with_hits(age in 0i64..200, hits in 0u64..1_000_000) {
            let (fewer, now) = entry_with(age, hits);
            let mut more = fewer.clone();
            more.hit_count = hits + 1;
            prop_assert!(more.effective_score_at(now) > fewer.effective_score_at(now));
        }
    }
}
