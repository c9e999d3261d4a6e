//! PULSE Relation - Hebbian Peer Trust
//!
//! Answers "how much should this device trust and prefer a peer", and
//! evolves the answer from outcomes:
//! - collaborations strengthen (LTP) or weaken (LTD) a relation
//! - passive observations nudge it by a smaller amount
//! - idle relations decay geometrically and are dropped below the floor
//! - repeated protocol violations erode it
//!
//! Every update for one event happens under the relation's map entry lock,
//! so a concurrent decay pass never discards an update.

pub mod relation;

pub use relation::{
    observation_delta, quality_modifier, response_time_modifier, strength_delta, CollaborationEvent,
    MirrorObservation, NodeRelation, ObservedOutcome, TrustLevel,
};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pulse_core::{NodeId, RelationConfig, TaskType, Timestamp};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// A peer ranked for a task type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendedNode {
    pub peer_id: NodeId,
    pub score: f64,
    pub connection_strength: f64,
    pub trust_level: TrustLevel,
}

/// Result of one decay pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecayReport {
    pub decayed: usize,
    pub removed: Vec<NodeId>,
}

/// Result of reporting a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ViolationVerdict {
    pub count: u32,
    pub penalized: bool,
    /// Strength after the penalty, if a relation exists
    pub strength: Option<f64>,
}

/// Aggregate view for observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelationSummary {
    pub total: usize,
    pub by_trust_level: BTreeMap<TrustLevel, usize>,
    pub average_strength: f64,
}

/// Trust relations with every peer this device has dealt with.
pub struct RelationModel {
    config: RelationConfig,
    relations: DashMap<NodeId, NodeRelation>,
    violations: DashMap<NodeId, u32>,
    summary_tx: watch::Sender<RelationSummary>,
}

impl RelationModel {
    pub fn new(config: RelationConfig) -> Self {
        let (summary_tx, _) = watch::channel(RelationSummary::default());
        Self {
            config,
            relations: DashMap::new(),
            violations: DashMap::new(),
            summary_tx,
        }
    }

    pub fn config(&self) -> &RelationConfig {
        &self.config
    }

    fn clamp(&self, strength: f64) -> f64 {
        strength.clamp(self.config.min_strength, self.config.max_strength)
    }

    /// Apply one collaboration outcome and return the updated relation.
    ///
    /// An unseen peer starts at `initial_strength + delta`.
    pub fn record_collaboration(&self, event: &CollaborationEvent) -> NodeRelation {
        let delta = strength_delta(&self.config, event.success, event.quality, event.response_time_ms);
        let snapshot = match self.relations.entry(event.peer_id.clone()) {
            Entry::Occupied(mut slot) => {
                let relation = slot.get_mut();
                relation.connection_strength = self.clamp(relation.connection_strength + delta);
                relation.absorb(&self.config, event);
                relation.clone()
            }
            Entry::Vacant(slot) => {
                let strength = self.clamp(self.config.initial_strength + delta);
                let mut relation = NodeRelation::new(event.peer_id.clone(), strength, event.timestamp);
                relation.absorb(&self.config, event);
                info!(peer_id = %event.peer_id, strength, "New peer relation");
                slot.insert(relation).clone()
            }
        };
        debug!(
            peer_id = %snapshot.peer_id,
            success = event.success,
            delta,
            strength = snapshot.connection_strength,
            trust = ?snapshot.trust_level,
            "Recorded collaboration"
        );
        self.publish();
        snapshot
    }

    /// Apply a mirror-learning nudge from watching a peer work.
    ///
    /// Observing an unseen peer opens a relation at the initial strength
    /// without counting a collaboration.
    pub fn record_observation(&self, observation: &MirrorObservation) -> NodeRelation {
        let delta = observation_delta(&self.config, observation.outcome, observation.learning_value);
        let snapshot = {
            let mut relation = self.relations.entry(observation.peer_id.clone()).or_insert_with(|| {
                NodeRelation::new(
                    observation.peer_id.clone(),
                    self.config.initial_strength,
                    observation.timestamp,
                )
            });
            relation.connection_strength = self.clamp(relation.connection_strength + delta);
            relation.mirror_observations += 1;
            relation.clone()
        };
        debug!(
            peer_id = %snapshot.peer_id,
            outcome = ?observation.outcome,
            delta,
            "Recorded mirror observation"
        );
        self.publish();
        snapshot
    }

    /// Count a protocol violation. The first `violation_allowance` are free;
    /// each further one costs an LTD-sized penalty on an existing relation.
    pub fn record_protocol_violation(&self, peer_id: &str) -> ViolationVerdict {
        let count = {
            let mut count = self.violations.entry(peer_id.to_string()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        if count <= self.config.violation_allowance {
            debug!(peer_id, count, "Protocol violation tolerated");
            return ViolationVerdict {
                count,
                penalized: false,
                strength: self.strength_of(peer_id),
            };
        }

        let strength = self.relations.get_mut(peer_id).map(|mut relation| {
            relation.connection_strength = self.clamp(relation.connection_strength - self.config.ltd_rate);
            relation.connection_strength
        });
        warn!(peer_id, count, strength = ?strength, "Repeated protocol violations, relation penalized");
        if strength.is_some() {
            self.publish();
        }
        ViolationVerdict {
            count,
            penalized: strength.is_some(),
            strength,
        }
    }

    pub fn violation_count(&self, peer_id: &str) -> u32 {
        self.violations.get(peer_id).map(|c| *c).unwrap_or(0)
    }

    pub fn perform_decay(&self) -> DecayReport {
        self.perform_decay_at(Utc::now())
    }

    /// Decay every relation idle for at least one full period.
    ///
    /// Whole elapsed periods since the later of the last collaboration and
    /// the last settled decay are applied at once, so repeated passes at the
    /// same instant are no-ops. Relations falling below `min_strength` are
    /// removed.
    pub fn perform_decay_at(&self, now: Timestamp) -> DecayReport {
        let period_ms = self.config.decay_period.as_millis() as i64;
        let mut report = DecayReport::default();
        if period_ms <= 0 {
            return report;
        }
        let factor = 1.0 - self.config.decay_rate;

        self.relations.retain(|peer_id, relation| {
            let reference = relation.last_collaboration.max(relation.last_decayed_at);
            let elapsed_ms = now.signed_duration_since(reference).num_milliseconds();
            let cycles = elapsed_ms / period_ms;
            if cycles <= 0 {
                return true;
            }
            relation.connection_strength *= factor.powi(cycles.min(i32::MAX as i64) as i32);
            relation.last_decayed_at = reference + chrono::Duration::milliseconds(cycles * period_ms);
            report.decayed += 1;
            if relation.connection_strength < self.config.min_strength {
                report.removed.push(peer_id.clone());
                false
            } else {
                true
            }
        });

        for peer_id in &report.removed {
            self.violations.remove(peer_id);
        }
        if report.decayed > 0 {
            info!(decayed = report.decayed, removed = report.removed.len(), "Relation decay pass");
            self.publish();
        }
        report
    }

    /// Best peers for `task_type`, highest score first, ties by peer id.
    pub fn get_recommended_nodes(&self, task_type: TaskType, limit: usize) -> Vec<RecommendedNode> {
        let mut ranked: Vec<RecommendedNode> = self
            .relations
            .iter()
            .filter(|r| r.connection_strength >= self.config.min_strength)
            .map(|r| RecommendedNode {
                peer_id: r.peer_id.clone(),
                score: r.recommendation_score(task_type),
                connection_strength: r.connection_strength,
                trust_level: r.trust_level,
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.peer_id.cmp(&b.peer_id)));
        ranked.truncate(limit);
        ranked
    }

    pub fn get(&self, peer_id: &str) -> Option<NodeRelation> {
        self.relations.get(peer_id).map(|r| r.clone())
    }

    /// Connection strength, 0 for peers without a relation.
    pub fn strength_of(&self, peer_id: &str) -> Option<f64> {
        self.relations.get(peer_id).map(|r| r.connection_strength)
    }

    pub fn strength(&self, peer_id: &str) -> f64 {
        self.strength_of(peer_id).unwrap_or(0.0)
    }

    pub fn expertise(&self, peer_id: &str, task_type: TaskType) -> f64 {
        self.relations
            .get(peer_id)
            .map(|r| r.expertise_for(task_type))
            .unwrap_or(0.0)
    }

    pub fn trust_level(&self, peer_id: &str) -> TrustLevel {
        self.relations
            .get(peer_id)
            .map(|r| r.trust_level)
            .unwrap_or(TrustLevel::Unknown)
    }

    /// All relations, sorted by peer id.
    pub fn relations(&self) -> Vec<NodeRelation> {
        let mut all: Vec<NodeRelation> = self.relations.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        all
    }

    pub fn remove(&self, peer_id: &str) -> Option<NodeRelation> {
        self.violations.remove(peer_id);
        let removed = self.relations.remove(peer_id).map(|(_, r)| r);
        if removed.is_some() {
            self.publish();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn summary(&self) -> RelationSummary {
        let mut by_trust_level: BTreeMap<TrustLevel, usize> =
            TrustLevel::ALL.iter().map(|level| (*level, 0)).collect();
        let mut total_strength = 0.0;
        let mut total = 0;
        for relation in self.relations.iter() {
            *by_trust_level.entry(relation.trust_level).or_insert(0) += 1;
            total_strength += relation.connection_strength;
            total += 1;
        }
        RelationSummary {
            total,
            by_trust_level,
            average_strength: if total == 0 { 0.0 } else { total_strength / total as f64 },
        }
    }

    /// Latest-value stream of the relation summary.
    pub fn subscribe(&self) -> WatchStream<RelationSummary> {
        WatchStream::new(self.summary_tx.subscribe())
    }

    fn publish(&self) {
        let summary = self.summary();
        self.summary_tx.send_replace(summary);
    }
}

impl Default for RelationModel {
    fn default() -> Self {
        Self::new(RelationConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
