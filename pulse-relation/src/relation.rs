//! Per-peer relation records and the events that shape them

use chrono::Utc;
use pulse_core::{NodeId, RelationConfig, TaskType, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// TRUST LEVEL
// ============================================================================

/// Trust tier, derived from the cumulative collaboration count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustLevel {
    Unknown,
    Novice,
    Familiar,
    Trusted,
    Intimate,
}

impl TrustLevel {
    pub const ALL: [TrustLevel; 5] = [
        TrustLevel::Unknown,
        TrustLevel::Novice,
        TrustLevel::Familiar,
        TrustLevel::Trusted,
        TrustLevel::Intimate,
    ];

    pub fn from_collaborations(count: u64) -> Self {
        match count {
            0 => TrustLevel::Unknown,
            1..=3 => TrustLevel::Novice,
            4..=10 => TrustLevel::Familiar,
            11..=50 => TrustLevel::Trusted,
            _ => TrustLevel::Intimate,
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Outcome of one piece of work done together with a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationEvent {
    pub peer_id: NodeId,
    pub task_type: TaskType,
    pub success: bool,
    /// Quality in [0, 1]
    pub quality: f64,
    pub response_time_ms: u64,
    pub timestamp: Timestamp,
}

impl CollaborationEvent {
    pub fn new(
        peer_id: impl Into<NodeId>,
        task_type: TaskType,
        success: bool,
        quality: f64,
        response_time_ms: u64,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            task_type,
            success,
            quality,
            response_time_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// How a passively observed peer fared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservedOutcome {
    Optimal,
    Success,
    Neutral,
    Failure,
}

impl ObservedOutcome {
    /// Signed weight of the outcome in a mirror nudge.
    pub fn weight(&self) -> f64 {
        match self {
            ObservedOutcome::Optimal => 1.0,
            ObservedOutcome::Success => 0.6,
            ObservedOutcome::Neutral => 0.1,
            ObservedOutcome::Failure => -0.5,
        }
    }
}

/// Something seen about a peer without working with it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorObservation {
    pub peer_id: NodeId,
    pub task_type: TaskType,
    pub outcome: ObservedOutcome,
    /// How much this observation should count, in [0, 1]
    pub learning_value: f64,
    pub timestamp: Timestamp,
}

impl MirrorObservation {
    pub fn new(peer_id: impl Into<NodeId>, task_type: TaskType, outcome: ObservedOutcome, learning_value: f64) -> Self {
        Self {
            peer_id: peer_id.into(),
            task_type,
            outcome,
            learning_value,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// LEARNING RULES
// ============================================================================

/// `(quality - 0.5) × 2 × quality_weight`
pub fn quality_modifier(config: &RelationConfig, quality: f64) -> f64 {
    (quality.clamp(0.0, 1.0) - 0.5) * 2.0 * config.quality_weight
}

/// Bonus for fast answers, penalty for slow ones.
pub fn response_time_modifier(config: &RelationConfig, response_time_ms: u64) -> f64 {
    if response_time_ms < config.fast_response_ms {
        0.2 * config.response_time_weight
    } else if response_time_ms > config.slow_response_ms {
        -0.2 * config.response_time_weight
    } else {
        0.0
    }
}

/// Strength change caused by one collaboration.
pub fn strength_delta(config: &RelationConfig, success: bool, quality: f64, response_time_ms: u64) -> f64 {
    let base = if success { config.ltp_rate } else { -config.ltd_rate };
    base * (1.0 + quality_modifier(config, quality) + response_time_modifier(config, response_time_ms))
}

/// Mirror learning nudge: smaller than a collaboration, signed by outcome.
pub fn observation_delta(config: &RelationConfig, outcome: ObservedOutcome, learning_value: f64) -> f64 {
    config.mirror_learning_rate * outcome.weight() * learning_value.clamp(0.0, 1.0)
}

// ============================================================================
// NODE RELATION
// ============================================================================

/// What this device has learned about one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRelation {
    pub peer_id: NodeId,
    /// Strength in [min_strength, max_strength]
    pub connection_strength: f64,
    pub collaboration_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub trust_level: TrustLevel,
    pub first_contact: Timestamp,
    pub last_collaboration: Timestamp,
    /// Decay is settled up to this instant
    pub last_decayed_at: Timestamp,
    pub average_quality: f64,
    pub average_response_time_ms: f64,
    pub expertise: BTreeMap<TaskType, f64>,
    pub mirror_observations: u64,
}

impl NodeRelation {
    pub(crate) fn new(peer_id: NodeId, strength: f64, at: Timestamp) -> Self {
        Self {
            peer_id,
            connection_strength: strength,
            collaboration_count: 0,
            success_count: 0,
            failure_count: 0,
            trust_level: TrustLevel::Unknown,
            first_contact: at,
            last_collaboration: at,
            last_decayed_at: at,
            average_quality: 0.0,
            average_response_time_ms: 0.0,
            expertise: BTreeMap::new(),
            mirror_observations: 0,
        }
    }

    /// Fold a collaboration into counts, averages and expertise. Strength is
    /// handled by the caller.
    pub(crate) fn absorb(&mut self, config: &RelationConfig, event: &CollaborationEvent) {
        let quality = event.quality.clamp(0.0, 1.0);
        self.collaboration_count += 1;
        if event.success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        let n = self.collaboration_count as f64;
        self.average_quality += (quality - self.average_quality) / n;
        self.average_response_time_ms += (event.response_time_ms as f64 - self.average_response_time_ms) / n;

        let target = if event.success { quality } else { 0.0 };
        let expertise = self.expertise.entry(event.task_type).or_insert(0.0);
        *expertise += config.expertise_learning_rate * (target - *expertise);

        if event.timestamp > self.last_collaboration {
            self.last_collaboration = event.timestamp;
        }
        self.trust_level = TrustLevel::from_collaborations(self.collaboration_count);
    }

    pub fn success_rate(&self) -> f64 {
        if self.collaboration_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.collaboration_count as f64
        }
    }

    pub fn expertise_for(&self, task_type: TaskType) -> f64 {
        self.expertise.get(&task_type).copied().unwrap_or(0.0)
    }

    /// `0.5 × strength + 0.3 × expertise + 0.2 × success rate`
    pub fn recommendation_score(&self, task_type: TaskType) -> f64 {
        0.5 * self.connection_strength + 0.3 * self.expertise_for(task_type) + 0.2 * self.success_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_trust_boundaries() {
        assert_eq!(TrustLevel::from_collaborations(0), TrustLevel::Unknown);
        assert_eq!(TrustLevel::from_collaborations(1), TrustLevel::Novice);
        assert_eq!(TrustLevel::from_collaborations(3), TrustLevel::Novice);
        assert_eq!(TrustLevel::from_collaborations(4), TrustLevel::Familiar);
        assert_eq!(TrustLevel::from_collaborations(10), TrustLevel::Familiar);
        assert_eq!(TrustLevel::from_collaborations(11), TrustLevel::Trusted);
        assert_eq!(TrustLevel::from_collaborations(50), TrustLevel::Trusted);
        assert_eq!(TrustLevel::from_collaborations(51), TrustLevel::Intimate);
    }

    #[test]
    fn test_delta_modifiers() {
        let config = RelationConfig::default();
        assert!((quality_modifier(&config, 0.9) - 0.24).abs() < 1e-12);
        assert!((response_time_modifier(&config, 50) - 0.04).abs() < 1e-12);
        assert_eq!(response_time_modifier(&config, 100), 0.0);
        assert_eq!(response_time_modifier(&config, 5000), 0.0);
        assert!((response_time_modifier(&config, 5001) + 0.04).abs() < 1e-12);
        assert!((strength_delta(&config, true, 0.9, 50) - 0.128).abs() < 1e-12);
        assert!(strength_delta(&config, false, 0.5, 1000) < 0.0);
    }

    #[test]
    fn test_observation_weights_ordered() {
        let config = RelationConfig::default();
        let d = |o| observation_delta(&config, o, 1.0);
        assert!(d(ObservedOutcome::Optimal) > d(ObservedOutcome::Success));
        assert!(d(ObservedOutcome::Success) > d(ObservedOutcome::Neutral));
        assert!(d(ObservedOutcome::Neutral) > d(ObservedOutcome::Failure));
        assert!(d(ObservedOutcome::Optimal) < strength_delta(&config, true, 0.5, 1000));
    }

    #[test]
    fn test_absorb_tracks_averages_and_expertise() {
        let config = RelationConfig::default();
        let mut relation = NodeRelation::new("peer".to_string(), 0.1, Utc::now());
        relation.absorb(&config, &CollaborationEvent::new("peer", TaskType::Translation, true, 1.0, 200));
        relation.absorb(&config, &CollaborationEvent::new("peer", TaskType::Translation, false, 0.5, 400));
        assert_eq!(relation.collaboration_count, 2);
        assert!((relation.average_quality - 0.75).abs() < 1e-12);
        assert!((relation.average_response_time_ms - 300.0).abs() < 1e-12);
        // 0 -> 0.1 -> 0.09
        assert!((relation.expertise_for(TaskType::Translation) - 0.09).abs() < 1e-12);
        assert_eq!(relation.expertise_for(TaskType::Embedding), 0.0);
        assert_eq!(relation.success_rate(), 0.5);
        assert_eq!(relation.trust_level, TrustLevel::Novice);
    }

    proptest! {
        #[test]
        fn prop_trust_level_is_monotonic(a in 0u64..200, b in 0u64..200) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(TrustLevel::from_collaborations(lo) <= TrustLevel::from_collaborations(hi));
        }
    }
}
