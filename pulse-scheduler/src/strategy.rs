//! Pluggable peer selection

use pulse_predict::{capability_match, CandidateNode};
use pulse_core::{NodeId, TaskSubmitRequest};
use pulse_relation::RelationModel;
use serde::Serialize;
use std::sync::Arc;

/// A candidate that passed the hard requirements, with its score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    pub node_id: NodeId,
    pub score: f64,
}

/// Decides which peers a task should go to.
///
/// Candidates failing a hard requirement (memory, NPU) are removed before
/// [`score`](Self::score) is ever called.
pub trait AllocationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Score a candidate that satisfies the task's hard requirements.
    fn score(&self, task: &TaskSubmitRequest, candidate: &CandidateNode) -> f64;

    /// Feasible candidates, best first, ties by node id.
    fn rank(&self, task: &TaskSubmitRequest, candidates: &[CandidateNode]) -> Vec<Allocation> {
        let requirements = &task.requirements;
        let mut ranked: Vec<Allocation> = candidates
            .iter()
            .filter(|c| {
                c.capabilities
                    .satisfies(requirements.min_memory_mb, requirements.requires_npu)
            })
            .map(|c| Allocation {
                node_id: c.node_id.clone(),
                score: self.score(task, c),
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.node_id.cmp(&b.node_id)));
        ranked
    }
}

/// Pure capability fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityStrategy;

impl AllocationStrategy for CapabilityStrategy {
    fn name(&self) -> &'static str {
        "capability"
    }

    fn score(&self, task: &TaskSubmitRequest, candidate: &CandidateNode) -> f64 {
        capability_match(task, &candidate.capabilities)
    }
}

/// Capability blended with learned trust:
/// `0.4 capability + 0.3 strength + 0.2 expertise + 0.1 (1 - load)`.
#[derive(Clone)]
pub struct RelationAwareStrategy {
    relations: Arc<RelationModel>,
}

impl RelationAwareStrategy {
    pub fn new(relations: Arc<RelationModel>) -> Self {
        Self { relations }
    }
}

impl AllocationStrategy for RelationAwareStrategy {
    fn name(&self) -> &'static str {
        "relation_aware"
    }

    fn score(&self, task: &TaskSubmitRequest, candidate: &CandidateNode) -> f64 {
        let capability = capability_match(task, &candidate.capabilities);
        let strength = self.relations.strength(&candidate.node_id);
        let expertise = self.relations.expertise(&candidate.node_id, task.task_type);
        0.4 * capability + 0.3 * strength + 0.2 * expertise + 0.1 * (1.0 - candidate.load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::TaskType;
    use pulse_relation::CollaborationEvent;
    use pulse_test_utils::fixtures;

    fn candidates() -> Vec<CandidateNode> {
        vec![
            CandidateNode::new("low", fixtures::low_memory_capabilities(), 0.0),
            CandidateNode::new("phone-a", fixtures::phone_capabilities(), 0.2),
            CandidateNode::new("phone-b", fixtures::phone_capabilities(), 0.2),
            CandidateNode::new("flagship", fixtures::npu_capabilities(), 0.5),
        ]
    }

    #[test]
    fn test_hard_requirements_filter_before_scoring() {
        let ranked = CapabilityStrategy.rank(&fixtures::npu_request("x"), &candidates());
        let ids: Vec<_> = ranked.iter().map(|a| a.node_id.as_str()).collect();
        assert_eq!(ids, vec!["flagship"]);

        let ranked = CapabilityStrategy.rank(&fixtures::text_request("x"), &candidates());
        assert!(ranked.iter().all(|a| a.node_id != "low"));
    }

    #[test]
    fn test_capability_ties_break_by_id() {
        let ranked = CapabilityStrategy.rank(&fixtures::text_request("x"), &candidates());
        let ids: Vec<_> = ranked.iter().map(|a| a.node_id.as_str()).collect();
        assert_eq!(ids, vec!["flagship", "phone-a", "phone-b"]);
    }

    #[test]
    fn test_relation_aware_prefers_trusted_peer() {
        let relations = Arc::new(RelationModel::default());
        for _ in 0..10 {
            relations.record_collaboration(&CollaborationEvent::new("phone-b", TaskType::TextGeneration, true, 0.95, 40));
        }
        let strategy = RelationAwareStrategy::new(Arc::clone(&relations));
        let phones: Vec<_> = candidates().into_iter().filter(|c| c.node_id.starts_with("phone")).collect();
        let ranked = strategy.rank(&fixtures::text_request("x"), &phones);
        assert_eq!(ranked[0].node_id, "phone-b");
        assert!(ranked[0].score > ranked[1].score);
        assert_eq!(strategy.name(), "relation_aware");
    }
}
