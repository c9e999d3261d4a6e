//! PULSE Cache - Semantic Gossip Cache
//!
//! First-line answer reuse across the swarm. Answers produced on this device
//! live in the local pool; answers gossiped by peers live in the network pool.
//! A query is matched against both, local entries winning ties, and the
//! combined size is held under a hard cap by evicting the lowest effective
//! score first.

pub mod similarity;
pub mod stats;

pub use similarity::{CosineSimilarity, HybridSimilarity, JaccardSimilarity, QueryFeatures, SimilarityStrategy};
pub use stats::{CacheMetrics, CacheStats};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pulse_core::{CacheConfig, Embedding, EntityId, NodeId, SemanticCacheEntry, Timestamp};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

// ============================================================================
// LOOKUP TYPES
// ============================================================================

/// Which pool a hit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheOrigin {
    Local,
    Network,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    /// Entry state after the hit was recorded
    pub entry: SemanticCacheEntry,
    pub similarity: f64,
    pub origin: CacheOrigin,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheHit),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn into_hit(self) -> Option<CacheHit> {
        match self {
            CacheLookup::Hit(hit) => Some(hit),
            CacheLookup::Miss => None,
        }
    }
}

/// Outcome of merging a batch of peer-shared entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub duplicates: usize,
    /// Entries that originated on this node and came back around
    pub own: usize,
    pub evicted: usize,
}

// ============================================================================
// SEMANTIC CACHE
// ============================================================================

#[derive(Debug, Clone)]
struct IndexedEntry {
    entry: SemanticCacheEntry,
    features: QueryFeatures,
}

impl IndexedEntry {
    fn new(entry: SemanticCacheEntry) -> Self {
        let features = QueryFeatures::new(&entry.query, entry.embedding.clone());
        Self { entry, features }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pool {
    Local,
    Network,
}

struct Candidate {
    id: EntityId,
    similarity: f64,
    rank: f64,
}

/// Higher rank wins, then the lower id.
fn better(a: &Candidate, b: &Candidate) -> bool {
    match a.rank.total_cmp(&b.rank) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => a.id < b.id,
    }
}

fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Question→answer cache shared across the swarm.
pub struct SemanticCache {
    local_id: NodeId,
    config: CacheConfig,
    strategy: Arc<dyn SimilarityStrategy>,
    local: DashMap<EntityId, IndexedEntry>,
    network: DashMap<EntityId, IndexedEntry>,
    metrics: CacheMetrics,
    /// Serializes eviction passes so two writers never over-evict
    eviction: Mutex<()>,
}

impl SemanticCache {
    /// Cache using the hybrid cosine/Jaccard strategy.
    pub fn new(local_id: impl Into<NodeId>, config: CacheConfig) -> Self {
        Self::with_strategy(local_id, config, Arc::new(HybridSimilarity))
    }

    pub fn with_strategy(
        local_id: impl Into<NodeId>,
        config: CacheConfig,
        strategy: Arc<dyn SimilarityStrategy>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            config,
            strategy,
            local: DashMap::new(),
            network: DashMap::new(),
            metrics: CacheMetrics::default(),
            eviction: Mutex::new(()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Store an answer produced on this device.
    ///
    /// A local entry with the same (whitespace and case normalized) query is
    /// updated in place when the new quality is at least as high, and left
    /// alone otherwise. Returns the id of the entry holding the answer.
    pub fn store(&self, query: &str, embedding: Option<Embedding>, answer: &str, quality: f64) -> EntityId {
        let normalized = normalize_query(query);
        let existing = self
            .local
            .iter()
            .find(|e| normalize_query(&e.entry.query) == normalized)
            .map(|e| *e.key());

        if let Some(id) = existing {
            if let Some(mut slot) = self.local.get_mut(&id) {
                let quality = quality.clamp(0.0, 1.0);
                if quality >= slot.entry.quality {
                    let now = Utc::now();
                    slot.entry.answer = answer.to_string();
                    slot.entry.quality = quality;
                    slot.entry.created_at = now;
                    slot.entry.last_accessed = now;
                    if let Some(embedding) = embedding {
                        slot.entry.embedding = Some(embedding.clone());
                        slot.features.embedding = Some(embedding);
                    }
                    debug!(entry_id = %id, quality, "Replaced local cache answer");
                } else {
                    trace!(entry_id = %id, quality, kept = slot.entry.quality, "Kept higher quality local answer");
                }
                return id;
            }
        }

        let mut entry = SemanticCacheEntry::new(query, answer, quality, self.local_id.clone());
        if let Some(embedding) = embedding {
            entry = entry.with_embedding(embedding);
        }
        let id = entry.id;
        self.local.insert(id, IndexedEntry::new(entry));
        debug!(entry_id = %id, "Stored local cache entry");
        self.evict_to_capacity();
        id
    }

    /// Look up the best answer for `text` (and its embedding, if known).
    ///
    /// Local entries qualify on similarity alone. Network entries qualify the
    /// same way but are ranked by `similarity × effectiveScore`. The local
    /// candidate is returned whenever its similarity is at least that of the
    /// network candidate.
    pub fn query(&self, text: &str, embedding: Option<Embedding>) -> CacheLookup {
        self.query_at(text, embedding, Utc::now())
    }

    pub fn query_at(&self, text: &str, embedding: Option<Embedding>, now: Timestamp) -> CacheLookup {
        let features = QueryFeatures::new(text, embedding);

        let local = self.best_candidate(&self.local, &features, |similarity, _| similarity);
        let network = self.best_candidate(&self.network, &features, |similarity, entry| {
            similarity * entry.effective_score_at(now)
        });

        let pick = match (local, network) {
            (Some(l), Some(n)) if l.similarity >= n.similarity => Some((Pool::Local, l)),
            (_, Some(n)) => Some((Pool::Network, n)),
            (Some(l), None) => Some((Pool::Local, l)),
            (None, None) => None,
        };

        let hit = pick.and_then(|(pool, candidate)| {
            let map = self.pool(pool);
            let mut slot = map.get_mut(&candidate.id)?;
            slot.entry.record_hit(now);
            Some(CacheHit {
                entry: slot.entry.clone(),
                similarity: candidate.similarity,
                origin: match pool {
                    Pool::Local => CacheOrigin::Local,
                    Pool::Network => CacheOrigin::Network,
                },
            })
        });

        match hit {
            Some(hit) => {
                self.metrics.record_hit();
                trace!(entry_id = %hit.entry.id, similarity = hit.similarity, origin = ?hit.origin, "Cache hit");
                CacheLookup::Hit(hit)
            }
            None => {
                self.metrics.record_miss();
                CacheLookup::Miss
            }
        }
    }

    fn pool(&self, pool: Pool) -> &DashMap<EntityId, IndexedEntry> {
        match pool {
            Pool::Local => &self.local,
            Pool::Network => &self.network,
        }
    }

    fn best_candidate(
        &self,
        map: &DashMap<EntityId, IndexedEntry>,
        features: &QueryFeatures,
        rank: impl Fn(f64, &SemanticCacheEntry) -> f64,
    ) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;
        for item in map.iter() {
            let Some(similarity) = self.strategy.similarity(features, &item.features) else {
                continue;
            };
            if similarity <= self.config.similarity_threshold {
                continue;
            }
            let candidate = Candidate {
                id: *item.key(),
                similarity,
                rank: rank(similarity, &item.entry),
            };
            let replace = match &best {
                Some(current) => better(&candidate, current),
                None => true,
            };
            if replace {
                best = Some(candidate);
            }
        }
        best
    }

    /// Top entries worth gossiping, best effective score first.
    ///
    /// Both pools are considered; entries below the share floor never leave
    /// the device.
    pub fn shareable(&self, limit: usize) -> Vec<SemanticCacheEntry> {
        let now = Utc::now();
        let mut scored: Vec<(f64, SemanticCacheEntry)> = self
            .local
            .iter()
            .chain(self.network.iter())
            .filter(|e| e.entry.quality >= self.config.share_floor)
            .map(|e| (e.entry.effective_score_at(now), e.entry.clone()))
            .collect();
        scored.sort_by(|(sa, a), (sb, b)| sb.total_cmp(sa).then_with(|| a.id.cmp(&b.id)));
        scored.into_iter().take(limit).map(|(_, entry)| entry).collect()
    }

    /// Merge entries shared by peers, deduplicated by id.
    ///
    /// Entries that originated here, or whose id already exists in either
    /// pool, are skipped. Peer data never overwrites a local entry.
    pub fn ingest(&self, entries: Vec<SemanticCacheEntry>) -> IngestReport {
        let mut report = IngestReport::default();
        for mut entry in entries {
            if entry.source_node == self.local_id {
                report.own += 1;
                continue;
            }
            if self.local.contains_key(&entry.id) {
                report.duplicates += 1;
                continue;
            }
            entry.quality = entry.quality.clamp(0.0, 1.0);
            match self.network.entry(entry.id) {
                Entry::Occupied(_) => report.duplicates += 1,
                Entry::Vacant(slot) => {
                    slot.insert(IndexedEntry::new(entry));
                    report.accepted += 1;
                }
            }
        }
        self.metrics.record_ingested(report.accepted);
        if report.accepted > 0 {
            report.evicted = self.evict_to_capacity();
            debug!(
                accepted = report.accepted,
                duplicates = report.duplicates,
                evicted = report.evicted,
                "Ingested shared cache entries"
            );
        }
        report
    }

    pub fn evict_to_capacity(&self) -> usize {
        self.evict_to_capacity_at(Utc::now())
    }

    /// Evict lowest effective score first (ties by id) until the combined
    /// size is within `max_entries`. Returns the number evicted.
    pub fn evict_to_capacity_at(&self, now: Timestamp) -> usize {
        let _guard = self.eviction.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let total = self.len();
        if total <= self.config.max_entries {
            return 0;
        }
        let excess = total - self.config.max_entries;

        let mut scored: Vec<(f64, EntityId, Pool)> = self
            .local
            .iter()
            .map(|e| (e.entry.effective_score_at(now), *e.key(), Pool::Local))
            .chain(
                self.network
                    .iter()
                    .map(|e| (e.entry.effective_score_at(now), *e.key(), Pool::Network)),
            )
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let evicted = scored
            .into_iter()
            .take(excess)
            .filter(|(_, id, pool)| self.pool(*pool).remove(id).is_some())
            .count();
        self.metrics.record_evictions(evicted);
        debug!(evicted, cap = self.config.max_entries, "Evicted cache entries");
        evicted
    }

    pub fn get(&self, id: &EntityId) -> Option<SemanticCacheEntry> {
        self.local
            .get(id)
            .or_else(|| self.network.get(id))
            .map(|e| e.entry.clone())
    }

    pub fn remove(&self, id: &EntityId) -> Option<SemanticCacheEntry> {
        self.local
            .remove(id)
            .or_else(|| self.network.remove(id))
            .map(|(_, e)| e.entry)
    }

    /// Combined size of both pools.
    pub fn len(&self) -> usize {
        self.local.len() + self.network.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats::capture(&self.metrics, self.local.len(), self.network.len())
    }
}

// ============================================================================
// TESTS
// ============================================================================
