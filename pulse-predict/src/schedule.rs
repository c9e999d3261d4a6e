//! Node ranking inputs and schedule decisions

use pulse_core::{NodeCapabilities, NodeId, PeerNode, ResourceRequirements, TaskSubmitRequest};
use serde::Serialize;
use std::time::Duration;

/// A node that could take work, with its current load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateNode {
    pub node_id: NodeId,
    pub capabilities: NodeCapabilities,
    /// Current load in [0, 1]
    pub load: f64,
}

impl CandidateNode {
    pub fn new(node_id: impl Into<NodeId>, capabilities: NodeCapabilities, load: f64) -> Self {
        Self {
            node_id: node_id.into(),
            capabilities,
            load: load.clamp(0.0, 1.0),
        }
    }

    pub fn from_peer(peer: &PeerNode, load: f64) -> Self {
        Self::new(peer.id.clone(), peer.capabilities.clone(), load)
    }
}

/// What the scheduler knows about the swarm right now.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkState {
    pub candidates: Vec<CandidateNode>,
    pub average_latency_ms: f64,
    /// Average load in [0, 1]
    pub average_load: f64,
}

impl NetworkState {
    /// Averages the candidates' loads.
    pub fn new(candidates: Vec<CandidateNode>, average_latency_ms: f64) -> Self {
        let average_load = if candidates.is_empty() {
            0.0
        } else {
            candidates.iter().map(|c| c.load).sum::<f64>() / candidates.len() as f64
        };
        Self {
            candidates,
            average_latency_ms,
            average_load,
        }
    }

    pub fn available_nodes(&self) -> usize {
        self.candidates.len()
    }
}

/// A ranked candidate, with the reasons behind its score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeScore {
    pub node_id: NodeId,
    pub score: f64,
    pub capability_match: f64,
    pub reasons: Vec<String>,
}

/// How well `capabilities` fit a task, in [0, 1]. Zero when a hard
/// requirement (memory, NPU) is not met.
pub fn capability_match(task: &TaskSubmitRequest, capabilities: &NodeCapabilities) -> f64 {
    let ResourceRequirements {
        min_memory_mb,
        requires_npu,
        ..
    } = task.requirements;
    if !capabilities.satisfies(min_memory_mb, requires_npu) {
        return 0.0;
    }
    // tenths, so full marks land exactly on 1.0
    let mut tenths: u8 = if capabilities.supports(task.task_type.required_model()) {
        6
    } else {
        2
    };
    if capabilities.available_memory_mb >= min_memory_mb.saturating_mul(2) {
        tenths += 2;
    }
    if capabilities.has_npu || capabilities.has_gpu {
        tenths += 2;
    }
    f64::from(tenths.min(10)) / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LocalReason {
    NoSuitableNodes,
    NetworkPoor,
    LightTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueueReason {
    AllNodesBusy,
    HeavyTask,
}

/// Outcome of the schedule decision table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ScheduleDecision {
    ExecuteLocally {
        reason: LocalReason,
    },
    /// Run on the best-ranked remote nodes right away
    Assign {
        nodes: Vec<NodeId>,
        time_allowance: Duration,
    },
    Queue {
        reason: QueueReason,
        estimated_wait: Duration,
    },
    RequestPremium {
        reason: String,
    },
}

impl ScheduleDecision {
    pub fn label(&self) -> &'static str {
        match self {
            ScheduleDecision::ExecuteLocally { .. } => "execute_locally",
            ScheduleDecision::Assign { .. } => "assign",
            ScheduleDecision::Queue { .. } => "queue",
            ScheduleDecision::RequestPremium { .. } => "request_premium",
        }
    }
}
