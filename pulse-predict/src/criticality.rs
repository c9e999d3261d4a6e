//! Exploration/exploitation controller
//!
//! Keeps the swarm near the edge between trying unproven peers and sticking
//! with known-good ones. Rolling prediction accuracy drives the exploration
//! ratio by a fixed step; the phase label is a pure function of the ratio.

use chrono::Utc;
use pulse_core::{CriticalityConfig, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Named band of the exploration ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CriticalityPhase {
    Exploration,
    Exploitation,
    Balanced,
    Chaotic,
    Ordered,
}

impl CriticalityPhase {
    pub fn for_ratio(ratio: f64, config: &CriticalityConfig) -> Self {
        if ratio >= config.max_exploration {
            CriticalityPhase::Chaotic
        } else if ratio > 0.4 {
            CriticalityPhase::Exploration
        } else if ratio <= config.min_exploration {
            CriticalityPhase::Ordered
        } else if ratio < 0.1 {
            CriticalityPhase::Exploitation
        } else {
            CriticalityPhase::Balanced
        }
    }
}

/// Result of one prediction, as fed back by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FeedbackOutcome {
    Hit,
    Miss,
    /// Partial match with a score in [0, 1]
    PartialHit(f64),
}

impl FeedbackOutcome {
    /// Contribution to accuracy: 1 for a hit, 0.5 for a partial hit above
    /// the threshold, 0 otherwise.
    pub fn credit(&self, partial_threshold: f64) -> f64 {
        match self {
            FeedbackOutcome::Hit => 1.0,
            FeedbackOutcome::PartialHit(score) if *score > partial_threshold => 0.5,
            FeedbackOutcome::PartialHit(_) | FeedbackOutcome::Miss => 0.0,
        }
    }
}

/// One ratio change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Adjustment {
    pub at: Timestamp,
    pub accuracy: f64,
    pub from_ratio: f64,
    pub to_ratio: f64,
    pub phase: CriticalityPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriticalityState {
    pub exploration_ratio: f64,
    pub exploitation_ratio: f64,
    pub phase: CriticalityPhase,
    pub recent_accuracy: f64,
    pub history: VecDeque<Adjustment>,
}

/// Owns the device's single criticality state.
#[derive(Debug, Clone)]
pub struct CriticalityController {
    config: CriticalityConfig,
    state: CriticalityState,
    window: VecDeque<FeedbackOutcome>,
}

/// Snap to a fine grid so repeated steps land exactly on phase boundaries.
fn snap(ratio: f64) -> f64 {
    (ratio * 1e9).round() / 1e9
}

impl CriticalityController {
    pub fn new(config: CriticalityConfig) -> Self {
        let ratio = snap(config.initial_exploration.clamp(config.min_exploration, config.max_exploration));
        let state = CriticalityState {
            exploration_ratio: ratio,
            exploitation_ratio: 1.0 - ratio,
            phase: CriticalityPhase::for_ratio(ratio, &config),
            recent_accuracy: 0.0,
            history: VecDeque::new(),
        };
        Self {
            config,
            state,
            window: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &CriticalityState {
        &self.state
    }

    pub fn exploration_ratio(&self) -> f64 {
        self.state.exploration_ratio
    }

    pub fn phase(&self) -> CriticalityPhase {
        self.state.phase
    }

    pub fn feedback_count(&self) -> usize {
        self.window.len()
    }

    /// Accuracy over the current window, 0 when empty.
    pub fn accuracy(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let credit: f64 = self
            .window
            .iter()
            .map(|o| o.credit(self.config.partial_hit_threshold))
            .sum();
        credit / self.window.len() as f64
    }

    /// Record an outcome and step the ratio if accuracy left the comfort
    /// band. Returns the adjustment when the ratio actually moved.
    pub fn record(&mut self, outcome: FeedbackOutcome) -> Option<Adjustment> {
        self.window.push_back(outcome);
        while self.window.len() > self.config.accuracy_window.max(1) {
            self.window.pop_front();
        }
        let accuracy = self.accuracy();
        self.state.recent_accuracy = accuracy;

        let current = self.state.exploration_ratio;
        let target = if accuracy < self.config.low_accuracy_threshold {
            current + self.config.adjustment_step
        } else if accuracy > self.config.high_accuracy_threshold {
            current - self.config.adjustment_step
        } else {
            current
        };
        let next = snap(target.clamp(self.config.min_exploration, self.config.max_exploration));
        if next == current {
            return None;
        }

        let phase = CriticalityPhase::for_ratio(next, &self.config);
        self.state.exploration_ratio = next;
        self.state.exploitation_ratio = 1.0 - next;
        self.state.phase = phase;

        let adjustment = Adjustment {
            at: Utc::now(),
            accuracy,
            from_ratio: current,
            to_ratio: next,
            phase,
        };
        self.state.history.push_back(adjustment.clone());
        while self.state.history.len() > self.config.history_limit {
            self.state.history.pop_front();
        }
        Some(adjustment)
    }
}

impl Default for CriticalityController {
    fn default() -> Self {
        Self::new(CriticalityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_phase_bands() {
        let config = CriticalityConfig::default();
        let phase = |r| CriticalityPhase::for_ratio(r, &config);
        assert_eq!(phase(0.5), CriticalityPhase::Chaotic);
        assert_eq!(phase(0.45), CriticalityPhase::Exploration);
        assert_eq!(phase(0.4), CriticalityPhase::Balanced);
        assert_eq!(phase(0.2), CriticalityPhase::Balanced);
        assert_eq!(phase(0.1), CriticalityPhase::Balanced);
        assert_eq!(phase(0.09), CriticalityPhase::Exploitation);
        assert_eq!(phase(0.05), CriticalityPhase::Ordered);
    }

    #[test]
    fn test_initial_state() {
        let controller = CriticalityController::default();
        assert_eq!(controller.exploration_ratio(), 0.2);
        assert_eq!(controller.phase(), CriticalityPhase::Balanced);
        assert_eq!(controller.accuracy(), 0.0);
    }

    #[test]
    fn test_misses_push_toward_exploration() {
        let mut controller = CriticalityController::default();
        let adj = controller.record(FeedbackOutcome::Miss).unwrap();
        assert_eq!(adj.from_ratio, 0.2);
        assert_eq!(adj.to_ratio, 0.25);
        for _ in 0..20 {
            controller.record(FeedbackOutcome::Miss);
        }
        assert_eq!(controller.exploration_ratio(), 0.5);
        assert_eq!(controller.phase(), CriticalityPhase::Chaotic);
        // already at the bound
        assert!(controller.record(FeedbackOutcome::Miss).is_none());
    }

    #[test]
    fn test_hits_push_toward_exploitation() {
        let mut controller = CriticalityController::default();
        for _ in 0..10 {
            controller.record(FeedbackOutcome::Hit);
        }
        assert_eq!(controller.exploration_ratio(), 0.05);
        assert_eq!(controller.phase(), CriticalityPhase::Ordered);
    }

    #[test]
    fn test_partial_hits_count_half_above_threshold() {
        assert_eq!(FeedbackOutcome::PartialHit(0.8).credit(0.7), 0.5);
        assert_eq!(FeedbackOutcome::PartialHit(0.7).credit(0.7), 0.0);

        let mut controller = CriticalityController::default();
        controller.record(FeedbackOutcome::Hit);
        controller.record(FeedbackOutcome::PartialHit(0.9));
        controller.record(FeedbackOutcome::Miss);
        controller.record(FeedbackOutcome::PartialHit(0.2));
        assert!((controller.accuracy() - 0.375).abs() < 1e-12);
    }

    #[test]
    fn test_window_and_history_are_bounded() {
        let config = CriticalityConfig {
            accuracy_window: 4,
            history_limit: 3,
            ..Default::default()
        };
        let mut controller = CriticalityController::new(config);
        for i in 0..40 {
            let outcome = if i % 10 < 5 { FeedbackOutcome::Hit } else { FeedbackOutcome::Miss };
            controller.record(outcome);
        }
        assert_eq!(controller.feedback_count(), 4);
        assert!(controller.state().history.len() <= 3);
    }

    #[test]
    fn test_accuracy_in_band_holds_ratio() {
        let mut controller = CriticalityController::default();
        controller.record(FeedbackOutcome::Hit);
        controller.record(FeedbackOutcome::Hit);
        let before = controller.exploration_ratio();
        // 2 hits of 3 is inside [0.5, 0.9]
        assert!(controller.record(FeedbackOutcome::Miss).is_none());
        assert_eq!(controller.exploration_ratio(), before);
    }

    fn arb_outcome() -> impl Strategy<Value = FeedbackOutcome> {
        prop_oneof![
            Just(FeedbackOutcome::Hit),
            Just(FeedbackOutcome::Miss),
            (0.0f64..=1.0).prop_map(FeedbackOutcome::PartialHit),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn prop_ratios_sum_to_one_and_stay_bounded(outcomes in prop::collection::vec(arb_outcome(), 0..300)) {
            let mut controller = CriticalityController::default();
            for outcome in outcomes {
                controller.record(outcome);
                let state = controller.state();
                prop_assert!((state.exploration_ratio + state.exploitation_ratio - 1.0).abs() < 1e-12);
                prop_assert!(state.exploration_ratio >= 0.05 && state.exploration_ratio <= 0.5);
            }
        }
    }
}
