//! PULSE Predict - Predictive Scheduling & Criticality
//!
//! Forecasts near-future needs, ranks candidate nodes for a task and decides
//! how a task should be scheduled. Prediction feedback drives the
//! [`CriticalityController`], whose exploration ratio in turn decides how
//! often exploratory predictions and ranking jitter kick in.

pub mod criticality;
pub mod prediction;
pub mod schedule;

pub use criticality::{Adjustment, CriticalityController, CriticalityPhase, CriticalityState, FeedbackOutcome};
pub use prediction::{
    follow_up, frequency_prediction, session_topic_prediction, time_of_day_prediction, FrequencyClass,
    Prediction, PredictionContext, PredictionFeedback, PredictionSource,
};
pub use schedule::{
    capability_match, CandidateNode, LocalReason, NetworkState, NodeScore, QueueReason, ScheduleDecision,
};

use chrono::Utc;
use dashmap::DashMap;
use pulse_core::{
    CriticalityConfig, NodeId, PredictorConfig, TaskComplexity, TaskSubmitRequest, TaskType, Timestamp,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info};

// ============================================================================
// NODE HISTORY
// ============================================================================

/// Smoothed observations of one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeHistory {
    pub availability: f64,
    pub load: f64,
    pub reliability: f64,
    pub completed_by_type: BTreeMap<TaskType, u32>,
    pub last_observed: Timestamp,
}

impl NodeHistory {
    fn first(load: f64, reachable: bool) -> Self {
        Self {
            availability: if reachable { 1.0 } else { 0.0 },
            load,
            reliability: 0.5,
            completed_by_type: BTreeMap::new(),
            last_observed: Utc::now(),
        }
    }

    /// Share of this node's completed work that was of `task_type`.
    pub fn specialization(&self, task_type: TaskType) -> f64 {
        let total: u32 = self.completed_by_type.values().sum();
        if total == 0 {
            return 0.0;
        }
        f64::from(self.completed_by_type.get(&task_type).copied().unwrap_or(0)) / f64::from(total)
    }
}

fn ema(previous: f64, sample: f64, alpha: f64) -> f64 {
    previous + alpha * (sample - previous)
}

/// Observer view of the predictor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionSummary {
    pub phase: CriticalityPhase,
    pub exploration_ratio: f64,
    pub exploitation_ratio: f64,
    pub accuracy: f64,
    pub pending_predictions: usize,
    pub feedback_count: usize,
}

// ============================================================================
// PREDICTIVE SCHEDULER
// ============================================================================

pub struct PredictiveScheduler {
    config: PredictorConfig,
    controller: Mutex<CriticalityController>,
    rng: Mutex<StdRng>,
    pending: Mutex<VecDeque<Prediction>>,
    history: DashMap<NodeId, NodeHistory>,
    summary_tx: watch::Sender<PredictionSummary>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PredictiveScheduler {
    pub fn new(config: PredictorConfig, criticality: CriticalityConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let controller = CriticalityController::new(criticality);
        let initial = PredictionSummary {
            phase: controller.phase(),
            exploration_ratio: controller.state().exploration_ratio,
            exploitation_ratio: controller.state().exploitation_ratio,
            accuracy: controller.accuracy(),
            pending_predictions: 0,
            feedback_count: 0,
        };
        let (summary_tx, _) = watch::channel(initial);
        Self {
            config,
            controller: Mutex::new(controller),
            rng: Mutex::new(rng),
            pending: Mutex::new(VecDeque::new()),
            history: DashMap::new(),
            summary_tx,
        }
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    pub fn phase(&self) -> CriticalityPhase {
        lock(&self.controller).phase()
    }

    pub fn exploration_ratio(&self) -> f64 {
        lock(&self.controller).exploration_ratio()
    }

    pub fn criticality(&self) -> CriticalityState {
        lock(&self.controller).state().clone()
    }

    // ------------------------------------------------------------------------
    // Forecasting
    // ------------------------------------------------------------------------

    /// Forecast what the user is likely to ask for next.
    ///
    /// Each heuristic contributes at most one prediction; an exploratory
    /// guess is added with probability equal to the exploration ratio. All
    /// returned predictions are retained for feedback.
    pub fn predict_next_needs(&self, context: &PredictionContext) -> Vec<Prediction> {
        let mut predictions = vec![time_of_day_prediction(context.now)];
        predictions.extend(session_topic_prediction(context));
        predictions.extend(frequency_prediction(context));

        let ratio = self.exploration_ratio();
        {
            let mut rng = lock(&self.rng);
            if rng.random_bool(ratio.clamp(0.0, 1.0)) {
                let task_type = TaskType::ALL[rng.random_range(0..TaskType::ALL.len())];
                predictions.push(Prediction::new(task_type, ratio, PredictionSource::Exploration));
            }
        }

        {
            let mut pending = lock(&self.pending);
            pending.extend(predictions.iter().cloned());
            while pending.len() > self.config.max_pending_predictions {
                pending.pop_front();
            }
        }
        debug!(count = predictions.len(), ratio, "Predicted next needs");
        self.publish();
        predictions
    }

    pub fn pending_predictions(&self) -> Vec<Prediction> {
        lock(&self.pending).iter().cloned().collect()
    }

    /// Score a prediction outcome and let the controller react.
    ///
    /// Feedback for a prediction that is no longer retained still counts
    /// toward accuracy.
    pub fn update_model(&self, feedback: PredictionFeedback) -> Option<Adjustment> {
        {
            let mut pending = lock(&self.pending);
            pending.retain(|p| p.id != feedback.prediction_id);
        }
        let (adjustment, previous_phase) = {
            let mut controller = lock(&self.controller);
            let previous = controller.phase();
            (controller.record(feedback.outcome), previous)
        };
        if let Some(adjustment) = &adjustment {
            if adjustment.phase != previous_phase {
                info!(
                    from = ?previous_phase,
                    to = ?adjustment.phase,
                    ratio = adjustment.to_ratio,
                    accuracy = adjustment.accuracy,
                    "Criticality phase changed"
                );
            } else {
                debug!(ratio = adjustment.to_ratio, accuracy = adjustment.accuracy, "Exploration ratio adjusted");
            }
        }
        self.publish();
        adjustment
    }

    // ------------------------------------------------------------------------
    // Node history
    // ------------------------------------------------------------------------

    /// Fold a load/reachability sample into the node's history.
    pub fn observe_node(&self, node_id: &str, load: f64, reachable: bool) {
        let load = load.clamp(0.0, 1.0);
        let alpha = self.config.history_smoothing;
        self.history
            .entry(node_id.to_string())
            .and_modify(|h| {
                h.availability = ema(h.availability, if reachable { 1.0 } else { 0.0 }, alpha);
                h.load = ema(h.load, load, alpha);
                h.last_observed = Utc::now();
            })
            .or_insert_with(|| NodeHistory::first(load, reachable));
    }

    /// Fold a finished task into the node's reliability and specialization.
    pub fn record_outcome(&self, node_id: &str, task_type: TaskType, success: bool) {
        let alpha = self.config.history_smoothing;
        let mut history = self
            .history
            .entry(node_id.to_string())
            .or_insert_with(|| NodeHistory::first(0.0, true));
        history.reliability = ema(history.reliability, if success { 1.0 } else { 0.0 }, alpha);
        if success {
            *history.completed_by_type.entry(task_type).or_insert(0) += 1;
        }
    }

    pub fn node_history(&self, node_id: &str) -> Option<NodeHistory> {
        self.history.get(node_id).map(|h| h.clone())
    }

    pub fn forget_node(&self, node_id: &str) {
        self.history.remove(node_id);
    }

    // ------------------------------------------------------------------------
    // Ranking
    // ------------------------------------------------------------------------

    /// Rank `candidates` for `task`, best first, ties by node id.
    ///
    /// `0.4 capability + 0.2 availability + 0.2 (1 - load) + 0.1 reliability
    /// + 0.1 specialization`, plus a small random bonus while exploring.
    pub fn find_optimal_nodes(&self, task: &TaskSubmitRequest, candidates: &[CandidateNode]) -> Vec<NodeScore> {
        let exploring = self.phase() == CriticalityPhase::Exploration;
        let mut rng = lock(&self.rng);

        let mut ranked: Vec<NodeScore> = candidates
            .iter()
            .map(|candidate| {
                let capability = capability_match(task, &candidate.capabilities);
                let history = self.history.get(&candidate.node_id).map(|h| h.clone());
                let (availability, load, reliability, specialization) = match &history {
                    Some(h) => (h.availability, h.load, h.reliability, h.specialization(task.task_type)),
                    None => (0.5, candidate.load, 0.5, 0.0),
                };

                let mut score = 0.4 * capability
                    + 0.2 * availability
                    + 0.2 * (1.0 - load)
                    + 0.1 * reliability
                    + 0.1 * specialization;
                let mut reasons = vec![
                    format!("capability match {capability:.2}"),
                    format!("predicted availability {availability:.2}"),
                    format!("predicted load {load:.2}"),
                    format!("reliability {reliability:.2}"),
                    format!("specialization {specialization:.2}"),
                ];
                if exploring && self.config.exploration_jitter > 0.0 {
                    let jitter = rng.random_range(0.0..self.config.exploration_jitter);
                    score += jitter;
                    reasons.push(format!("exploration bonus {jitter:.3}"));
                }
                NodeScore {
                    node_id: candidate.node_id.clone(),
                    score,
                    capability_match: capability,
                    reasons,
                }
            })
            .collect();

        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.node_id.cmp(&b.node_id)));
        ranked
    }

    // ------------------------------------------------------------------------
    // Decisions
    // ------------------------------------------------------------------------

    pub fn get_schedule_decision(&self, task: &TaskSubmitRequest, network: &NetworkState) -> ScheduleDecision {
        self.get_schedule_decision_at(task, network, Utc::now())
    }

    /// Decision table, first matching rule wins:
    ///
    /// 1. no available nodes: run locally
    /// 2. latency above the ceiling: run locally
    /// 3. heavy task with an imminent deadline: request premium handling,
    ///    even when the swarm is busy
    /// 4. average load above the busy threshold: queue
    /// 5. by complexity: light tasks run locally, moderate and complex go to
    ///    the best-ranked nodes, heavy tasks queue with a doubled estimate
    pub fn get_schedule_decision_at(
        &self,
        task: &TaskSubmitRequest,
        network: &NetworkState,
        now: Timestamp,
    ) -> ScheduleDecision {
        let decision = self.decide(task, network, now);
        debug!(
            task_type = %task.task_type,
            complexity = ?task.complexity,
            nodes = network.available_nodes(),
            latency_ms = network.average_latency_ms,
            load = network.average_load,
            decision = decision.label(),
            "Schedule decision"
        );
        decision
    }

    fn decide(&self, task: &TaskSubmitRequest, network: &NetworkState, now: Timestamp) -> ScheduleDecision {
        if network.available_nodes() == 0 {
            return ScheduleDecision::ExecuteLocally {
                reason: LocalReason::NoSuitableNodes,
            };
        }
        if network.average_latency_ms > self.config.latency_ceiling_ms {
            return ScheduleDecision::ExecuteLocally {
                reason: LocalReason::NetworkPoor,
            };
        }

        let heavy = task.complexity == TaskComplexity::Heavy;
        if heavy && self.deadline_imminent(task, now) {
            return ScheduleDecision::RequestPremium {
                reason: "heavy task with imminent deadline".to_string(),
            };
        }

        let estimate = task.requirements.estimated_duration;
        if network.average_load > self.config.busy_load_threshold {
            return ScheduleDecision::Queue {
                reason: QueueReason::AllNodesBusy,
                estimated_wait: estimate,
            };
        }

        match task.complexity {
            TaskComplexity::Trivial | TaskComplexity::Simple => ScheduleDecision::ExecuteLocally {
                reason: LocalReason::LightTask,
            },
            TaskComplexity::Moderate | TaskComplexity::Complex => {
                let nodes: Vec<NodeId> = self
                    .find_optimal_nodes(task, &network.candidates)
                    .into_iter()
                    .filter(|s| s.capability_match > 0.0)
                    .take(task.max_parallel_nodes.max(1) as usize)
                    .map(|s| s.node_id)
                    .collect();
                if nodes.is_empty() {
                    ScheduleDecision::ExecuteLocally {
                        reason: LocalReason::NoSuitableNodes,
                    }
                } else {
                    ScheduleDecision::Assign {
                        nodes,
                        time_allowance: with_overhead(estimate, self.config.overhead_factor),
                    }
                }
            }
            TaskComplexity::Heavy => ScheduleDecision::Queue {
                reason: QueueReason::HeavyTask,
                estimated_wait: with_overhead(estimate, self.config.overhead_factor),
            },
        }
    }

    fn deadline_imminent(&self, task: &TaskSubmitRequest, now: Timestamp) -> bool {
        let Some(deadline) = task.deadline else {
            return false;
        };
        let remaining_ms = deadline.signed_duration_since(now).num_milliseconds();
        remaining_ms <= self.config.imminent_deadline.as_millis() as i64
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    pub fn summary(&self) -> PredictionSummary {
        let pending_predictions = lock(&self.pending).len();
        let controller = lock(&self.controller);
        PredictionSummary {
            phase: controller.phase(),
            exploration_ratio: controller.state().exploration_ratio,
            exploitation_ratio: controller.state().exploitation_ratio,
            accuracy: controller.accuracy(),
            pending_predictions,
            feedback_count: controller.feedback_count(),
        }
    }

    pub fn subscribe(&self) -> WatchStream<PredictionSummary> {
        WatchStream::new(self.summary_tx.subscribe())
    }

    fn publish(&self) {
        let summary = self.summary();
        self.summary_tx.send_replace(summary);
    }
}

impl Default for PredictiveScheduler {
    fn default() -> Self {
        Self::new(PredictorConfig::default(), CriticalityConfig::default())
    }
}

/// `estimate` scaled by `factor`, saturating at `Duration::MAX`.
fn with_overhead(estimate: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(estimate.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Wait estimate helper for callers that only know a queue position.
pub fn queue_wait_estimate(position: usize, per_task: Duration) -> Duration {
    per_task.saturating_mul(position.max(1).min(u32::MAX as usize) as u32)
}

// ============================================================================
// TESTS
// ============================================================================
