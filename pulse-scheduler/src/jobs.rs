//! Maintenance Background Task
//!
//! One loop drives every periodic chore of a running node:
//!
//! - relation decay of idle peers
//! - the immune-memory sweep (expiry and idle decay of vaccines)
//! - eviction of peers that stopped talking
//! - cache gossip, heartbeat and the need forecast
//! - purging of long-finished tasks
//! - draining the task queue as capacity frees up
//!
//! Intervals come from [`JobsConfig`].

use crate::scheduler::TaskScheduler;
use pulse_core::JobsConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Interval, MissedTickBehavior};

// ============================================================================
// METRICS
// ============================================================================

/// Counters for maintenance activity since startup.
#[derive(Debug, Default)]
pub struct MaintenanceMetrics {
    pub decay_cycles: AtomicU64,
    /// Relations dropped after decaying to the floor
    pub relations_removed: AtomicU64,
    pub vaccines_expired: AtomicU64,
    pub peers_evicted: AtomicU64,
    pub gossip_rounds: AtomicU64,
    pub tasks_purged: AtomicU64,
    /// Queued tasks started by the drain
    pub tasks_drained: AtomicU64,
}

impl MaintenanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MaintenanceSnapshot {
        MaintenanceSnapshot {
            decay_cycles: self.decay_cycles.load(Ordering::Relaxed),
            relations_removed: self.relations_removed.load(Ordering::Relaxed),
            vaccines_expired: self.vaccines_expired.load(Ordering::Relaxed),
            peers_evicted: self.peers_evicted.load(Ordering::Relaxed),
            gossip_rounds: self.gossip_rounds.load(Ordering::Relaxed),
            tasks_purged: self.tasks_purged.load(Ordering::Relaxed),
            tasks_drained: self.tasks_drained.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of maintenance metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceSnapshot {
    pub decay_cycles: u64,
    pub relations_removed: u64,
    pub vaccines_expired: u64,
    pub peers_evicted: u64,
    pub gossip_rounds: u64,
    pub tasks_purged: u64,
    pub tasks_drained: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

fn ticker(period: std::time::Duration) -> Interval {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

/// Run periodic maintenance until the shutdown signal is received.
///
/// Returns the metrics collected during the task's lifetime.
pub async fn run_maintenance(
    scheduler: Arc<TaskScheduler>,
    config: JobsConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<MaintenanceMetrics> {
    let metrics = Arc::new(MaintenanceMetrics::new());

    let mut decay = ticker(config.decay_interval);
    let mut sweep = ticker(config.vaccine_sweep_interval);
    let mut silence = ticker(config.silence_check_interval);
    let mut gossip = ticker(config.gossip_interval);
    let mut purge = ticker(config.purge_interval);
    let mut drain = ticker(config.drain_interval);

    tracing::info!(
        decay_interval_secs = config.decay_interval.as_secs(),
        gossip_interval_secs = config.gossip_interval.as_secs(),
        drain_interval_ms = config.drain_interval.as_millis() as u64,
        "Maintenance task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Maintenance task shutting down");
                    break;
                }
            }

            _ = decay.tick() => {
                let report = scheduler.relations().perform_decay();
                metrics.decay_cycles.fetch_add(1, Ordering::Relaxed);
                add(&metrics.relations_removed, report.removed.len());
            }

            _ = sweep.tick() => {
                let report = scheduler.evolution().sweep_expired();
                add(&metrics.vaccines_expired, report.expired.len());
            }

            _ = silence.tick() => {
                let evicted = scheduler.evict_silent_peers();
                if !evicted.is_empty() {
                    tracing::info!(peers = ?evicted, "Evicted silent peers");
                }
                add(&metrics.peers_evicted, evicted.len());
            }

            _ = gossip.tick() => {
                scheduler.gossip_cache().await;
                scheduler.send_heartbeat().await;
                scheduler.forecast_needs();
                metrics.gossip_rounds.fetch_add(1, Ordering::Relaxed);
            }

            _ = purge.tick() => {
                add(&metrics.tasks_purged, scheduler.purge_terminal());
            }

            _ = drain.tick() => {
                add(&metrics.tasks_drained, scheduler.drain_queue().await);
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        decay_cycles = snapshot.decay_cycles,
        relations_removed = snapshot.relations_removed,
        vaccines_expired = snapshot.vaccines_expired,
        peers_evicted = snapshot.peers_evicted,
        gossip_rounds = snapshot.gossip_rounds,
        tasks_purged = snapshot.tasks_purged,
        tasks_drained = snapshot.tasks_drained,
        "Maintenance task completed"
    );

    metrics
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::harness;
    use pulse_core::TaskStatus;
    use pulse_test_utils::fixtures;
    use std::time::Duration;

    fn fast_jobs() -> JobsConfig {
        JobsConfig {
            decay_interval: Duration::from_millis(5),
            vaccine_sweep_interval: Duration::from_millis(5),
            silence_check_interval: Duration::from_millis(5),
            gossip_interval: Duration::from_millis(5),
            purge_interval: Duration::from_millis(5),
            drain_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_maintenance_runs_until_shutdown() {
        let h = harness("phone", fixtures::phone_capabilities());
        let job = tokio::spawn(run_maintenance(Arc::clone(&h.scheduler), fast_jobs(), h.shutdown_rx()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        h.shutdown();
        let snapshot = job.await.unwrap().snapshot();

        assert!(snapshot.decay_cycles >= 1);
        assert!(snapshot.gossip_rounds >= 1);
        assert_eq!(snapshot.peers_evicted, 0);
        assert!(h.scheduler.predictor().summary().pending_predictions >= 1);
    }

    #[tokio::test]
    async fn test_maintenance_drains_queue_when_load_drops() {
        let h = harness("phone", fixtures::phone_capabilities());
        let _tablet_inbox = h.add_silent_peer("tablet", fixtures::npu_capabilities());
        h.scheduler.peer_loads.insert("tablet".to_string(), 0.95);
        let outcome = h.scheduler.submit_task(fixtures::text_request("queued")).await;
        assert_eq!(h.scheduler.queue_len(), 1);

        h.scheduler.peer_loads.insert("tablet".to_string(), 0.2);
        let job = tokio::spawn(run_maintenance(Arc::clone(&h.scheduler), fast_jobs(), h.shutdown_rx()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        h.shutdown();
        let snapshot = job.await.unwrap().snapshot();

        assert_eq!(snapshot.tasks_drained, 1);
        let status = h.scheduler.task(&outcome.task_id()).unwrap().status;
        assert_ne!(status, TaskStatus::Queued);
        h.scheduler.cancel_task(&outcome.task_id()).await.unwrap();
    }
}
