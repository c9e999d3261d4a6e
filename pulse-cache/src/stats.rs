//! Cache counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated lock-free on the query and ingest paths.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    /// Peer-shared entries accepted by `ingest`
    pub ingested: AtomicU64,
}

impl CacheMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_ingested(&self, count: usize) {
        self.ingested.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Point-in-time view of the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub local_entries: usize,
    pub network_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub ingested: u64,
}

impl CacheStats {
    pub(crate) fn capture(metrics: &CacheMetrics, local_entries: usize, network_entries: usize) -> Self {
        Self {
            local_entries,
            network_entries,
            hits: metrics.hits.load(Ordering::Relaxed),
            misses: metrics.misses.load(Ordering::Relaxed),
            evictions: metrics.evictions.load(Ordering::Relaxed),
            ingested: metrics.ingested.load(Ordering::Relaxed),
        }
    }

    pub fn total_entries(&self) -> usize {
        self.local_entries + self.network_entries
    }

    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_empty_is_zero() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_capture_reads_counters() {
        let metrics = CacheMetrics::default();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_evictions(5);
        let stats = CacheStats::capture(&metrics, 2, 3);
        assert_eq!(stats.total_entries(), 5);
        assert_eq!(stats.evictions, 5);
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
