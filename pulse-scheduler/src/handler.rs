//! Inbound message handling
//!
//! Every message a peer sends ends up in [`TaskScheduler::handle_inbound`].
//! Requests from peers are served on spawned tasks so a slow inference call
//! never stalls the inbound loop.

use crate::scheduler::{experience_for, TaskScheduler};
use dashmap::mapref::entry::Entry;
use futures_util::{Stream, StreamExt};
use pulse_core::{
    EntityId, GovernorDecision, KnowledgeItem, MessagePayload, NodeAnnouncement, NodeId, PeerNode,
    ProtocolError, SemanticCacheEntry, SwarmMessage, TaskId, TaskOutcome, TaskStatus,
    TaskSubmitRequest, TaskType, TimeoutError,
};
use pulse_relation::{MirrorObservation, ObservedOutcome};
use pulse_transport::{Inbound, RelayOutcome};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Gossip topic carrying [`MirrorObservation`]s of third-party peers.
pub const OBSERVATION_TOPIC: &str = "relation.observation";

/// Quality at or above which an observed collaboration counts as optimal.
const OPTIMAL_QUALITY: f64 = 0.9;

/// Pump `inbound` into the scheduler until shutdown or end of stream.
pub async fn run_inbound_loop<S>(scheduler: Arc<TaskScheduler>, mut inbound: S, mut shutdown_rx: watch::Receiver<bool>)
where
    S: Stream<Item = Inbound> + Unpin,
{
    info!(node_id = %scheduler.local_id(), "Inbound loop started");
    loop {
        tokio::select! {
            next = inbound.next() => match next {
                Some(item) => scheduler.handle_inbound(item).await,
                None => {
                    warn!("Inbound stream ended");
                    break;
                }
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    info!(node_id = %scheduler.local_id(), "Inbound loop stopped");
}

impl TaskScheduler {
    pub async fn handle_inbound(self: &Arc<Self>, inbound: Inbound) {
        match inbound {
            Inbound::Message(message) => self.handle_message(message).await,
            Inbound::Violation { peer_id: Some(peer_id), error } => self.penalize(&peer_id, &error),
            Inbound::Violation { peer_id: None, error } => {
                warn!(error = %error, "Dropped frame from an unidentified connection");
            }
        }
    }

    fn penalize(&self, peer_id: &str, error: &ProtocolError) {
        let transport_count = self.registry.record_violation(peer_id);
        let verdict = self.relations.record_protocol_violation(peer_id);
        warn!(
            peer_id,
            error = %error,
            violations = transport_count,
            penalized = verdict.penalized,
            "Dropped invalid message"
        );
    }

    /// Dispatch one well-formed message.
    pub async fn handle_message(self: &Arc<Self>, message: SwarmMessage) {
        let sender = message.sender_id.clone();
        if sender == self.local_id {
            return;
        }
        if let Some(recipient) = &message.recipient_id {
            if *recipient != self.local_id {
                debug!(message_id = %message.id, recipient = %recipient, "Ignoring message for another node");
                return;
            }
        }
        if !message.payload_matches_type() {
            let error = ProtocolError::PayloadMismatch {
                declared: format!("{:?}", message.message_type),
            };
            self.penalize(&sender, &error);
            return;
        }
        self.registry.touch(&sender);

        match message.payload.clone() {
            MessagePayload::NodeAnnounce(announcement) => self.on_announce(announcement),
            MessagePayload::NodeHeartbeat {
                load,
                available_memory_mb,
                active_tasks,
            } => {
                let load = load.clamp(0.0, 1.0);
                self.peer_loads.insert(sender.clone(), load);
                self.predictor.observe_node(&sender, load, true);
                debug!(peer_id = %sender, load, available_memory_mb, active_tasks, "Heartbeat");
            }
            MessagePayload::NodeLeave { reason } => {
                self.registry.remove(&sender);
                self.peer_loads.remove(&sender);
                self.predictor.forget_node(&sender);
                info!(peer_id = %sender, reason = ?reason, "Peer left");
                self.publish_stats();
            }
            MessagePayload::TaskRequest { task_id, request } => self.serve_task_request(sender, task_id, request),
            MessagePayload::TaskResponse(outcome) => {
                let task_id = outcome.task_id;
                if !self.route_response(&sender, outcome) {
                    debug!(peer_id = %sender, task_id = %task_id, "Unsolicited task response");
                }
            }
            MessagePayload::TaskStatus {
                task_id,
                status,
                progress,
            } => self.on_task_status(&sender, task_id, status, progress),
            MessagePayload::TaskCancel { task_id, reason } => {
                if let Some((_, handle)) = self.served.remove(&(sender.clone(), task_id)) {
                    handle.abort();
                    self.inference.stop_generation();
                    info!(peer_id = %sender, task_id = %task_id, reason = ?reason, "Stopped work cancelled by peer");
                }
            }
            MessagePayload::CacheShare { entries } => self.ingest_entries(&sender, entries),
            MessagePayload::CacheQuery {
                query_id,
                query,
                embedding,
            } => self.answer_cache_query(sender, query_id, query, embedding).await,
            MessagePayload::CacheResponse { entry, similarity, .. } => {
                if let Some(entry) = entry {
                    debug!(peer_id = %sender, similarity, "Cache response");
                    self.ingest_entries(&sender, vec![entry]);
                }
            }
            MessagePayload::KnowledgeSync { items } => self.ingest_knowledge(&sender, items),
            MessagePayload::CapabilityUpdate { capabilities } => {
                if self.registry.update_capabilities(&sender, capabilities) {
                    debug!(peer_id = %sender, "Capabilities updated");
                }
            }
            MessagePayload::Gossip { topic, data } => {
                if let RelayOutcome::Duplicate = self.registry.relay(&message).await {
                    return;
                }
                if topic == OBSERVATION_TOPIC {
                    match serde_json::from_value::<MirrorObservation>(data) {
                        Ok(observation) if observation.peer_id != self.local_id => {
                            self.relations.record_observation(&observation);
                        }
                        Ok(_) => {}
                        Err(err) => debug!(peer_id = %sender, error = %err, "Unreadable observation"),
                    }
                } else {
                    debug!(peer_id = %sender, topic = %topic, "Gossip");
                }
            }
        }
    }

    fn on_announce(&self, announcement: NodeAnnouncement) {
        if announcement.node_id == self.local_id {
            return;
        }
        let peer = PeerNode::new(
            announcement.node_id.clone(),
            announcement.address,
            announcement.capabilities,
        )
        .with_display_name(announcement.display_name);
        if self.registry.upsert(peer) {
            info!(peer_id = %announcement.node_id, "Peer announced itself");
            self.publish_stats();
        }
    }

    fn on_task_status(&self, sender: &str, task_id: TaskId, status: TaskStatus, progress: f64) {
        let Some(task) = self.task(&task_id) else {
            return;
        };
        if !task.assigned_nodes.iter().any(|n| n == sender) {
            debug!(peer_id = sender, task_id = %task_id, "Status from a node not assigned to the task");
            return;
        }
        if let Some(mut info) = self.tasks.get_mut(&task_id) {
            if !info.status.is_terminal() {
                info.progress = progress.clamp(0.0, 1.0).max(info.progress);
            }
        }
        debug!(peer_id = sender, task_id = %task_id, status = ?status, progress, "Remote progress");
    }

    fn ingest_entries(&self, sender: &str, entries: Vec<SemanticCacheEntry>) {
        let report = self.cache.ingest(entries);
        debug!(
            peer_id = sender,
            accepted = report.accepted,
            duplicates = report.duplicates,
            evicted = report.evicted,
            "Ingested shared cache entries"
        );
    }

    /// Knowledge items land in the network cache as topic → content pairs.
    fn ingest_knowledge(&self, sender: &str, items: Vec<KnowledgeItem>) {
        let entries = items
            .into_iter()
            .map(|item| {
                let mut entry = SemanticCacheEntry::new(item.topic, item.content, item.confidence, item.source_node);
                entry.id = item.id;
                entry.created_at = item.created_at;
                entry
            })
            .collect();
        self.ingest_entries(sender, entries);
    }

    async fn answer_cache_query(
        &self,
        sender: NodeId,
        query_id: EntityId,
        query: String,
        embedding: Option<pulse_core::Embedding>,
    ) {
        let (entry, similarity) = match self.cache.query(&query, embedding).into_hit() {
            Some(hit) => (Some(hit.entry), hit.similarity),
            None => (None, 0.0),
        };
        let reply = SwarmMessage::new(
            self.local_id.clone(),
            MessagePayload::CacheResponse {
                query_id,
                entry,
                similarity,
            },
        )
        .to(sender.clone());
        if let Err(err) = self.registry.send(&sender, &reply).await {
            warn!(peer_id = %sender, error = %err, "Could not answer cache query");
        }
    }

    /// Execute a peer's task on this device and reply with the outcome.
    fn serve_task_request(self: &Arc<Self>, sender: NodeId, task_id: TaskId, request: TaskSubmitRequest) {
        // the entry lock is held until the handle is stored, so the spawned
        // task's own removal always finds it
        match self.served.entry((sender.clone(), task_id)) {
            Entry::Occupied(_) => {
                debug!(peer_id = %sender, task_id = %task_id, "Duplicate task request");
            }
            Entry::Vacant(slot) => {
                let this = Arc::clone(self);
                let handle = tokio::spawn(async move {
                    let outcome = this.serve(&sender, task_id, &request).await;
                    this.served.remove(&(sender.clone(), task_id));
                    let success = outcome.success;
                    let reply = SwarmMessage::new(this.local_id.clone(), MessagePayload::TaskResponse(outcome))
                        .to(sender.clone());
                    if let Err(err) = this.registry.send(&sender, &reply).await {
                        warn!(peer_id = %sender, task_id = %task_id, error = %err, "Could not deliver task response");
                    }
                    debug!(peer_id = %sender, task_id = %task_id, success, "Served task request");
                });
                slot.insert(handle);
            }
        }
    }

    async fn serve(&self, sender: &str, task_id: TaskId, request: &TaskSubmitRequest) -> TaskOutcome {
        let started = Instant::now();
        let failure = |reason: String| TaskOutcome {
            task_id,
            success: false,
            result: None,
            error: Some(reason),
            processing_time_ms: elapsed_ms(started),
            quality: 0.0,
        };

        let capabilities = self.local_capabilities();
        let requirements = &request.requirements;
        if !capabilities.satisfies(requirements.min_memory_mb, requirements.requires_npu) {
            return failure("this device does not meet the task's requirements".to_string());
        }
        let Some(_slot) = SlotGuard::reserve(self, &self.local_id) else {
            return failure("no free slot on this device".to_string());
        };
        if let GovernorDecision::Denied { reason } = self.ask_governor(request).await {
            return failure(reason);
        }

        let status = SwarmMessage::new(
            self.local_id.clone(),
            MessagePayload::TaskStatus {
                task_id,
                status: TaskStatus::Running,
                progress: 0.0,
            },
        )
        .to(sender.to_string());
        if let Err(err) = self.registry.send(sender, &status).await {
            debug!(peer_id = sender, error = %err, "Could not report progress");
        }

        let result = match tokio::time::timeout(request.timeout, self.execute_locally(request)).await {
            Ok(result) => result,
            Err(_) => Err(TimeoutError::TaskTimedOut {
                task_id,
                timeout: request.timeout,
            }
            .into()),
        };

        match result {
            Ok(value) => {
                self.evolution
                    .gain_experience(request.task_type, experience_for(request.complexity));
                TaskOutcome {
                    task_id,
                    success: true,
                    result: Some(value),
                    error: None,
                    processing_time_ms: elapsed_ms(started),
                    quality: self.config.scheduler.local_answer_quality,
                }
            }
            Err(err) => failure(err.to_string()),
        }
    }

    /// Tell the rest of the swarm how the helpers of a finished task fared.
    pub(crate) async fn share_observations(&self, task_type: TaskType, helpers: &[NodeId], quality: f64) {
        let outcome = if quality >= OPTIMAL_QUALITY {
            ObservedOutcome::Optimal
        } else {
            ObservedOutcome::Success
        };
        for helper in helpers {
            let observation = MirrorObservation::new(helper.clone(), task_type, outcome, quality.clamp(0.0, 1.0));
            let Ok(data) = serde_json::to_value(&observation) else {
                continue;
            };
            let message = SwarmMessage::new(
                self.local_id.clone(),
                MessagePayload::Gossip {
                    topic: OBSERVATION_TOPIC.to_string(),
                    data,
                },
            );
            self.registry.mark_seen(message.id);
            self.registry.broadcast_except(&message, &[helper.as_str()]).await;
        }
    }

    /// Number of peer requests this device is executing right now.
    pub fn served_count(&self) -> usize {
        self.served.len()
    }
}

/// A slot held on one node, released when dropped (including when the
/// owning future is aborted).
struct SlotGuard<'a> {
    scheduler: &'a TaskScheduler,
    node_id: &'a str,
}

impl<'a> SlotGuard<'a> {
    fn reserve(scheduler: &'a TaskScheduler, node_id: &'a str) -> Option<Self> {
        scheduler
            .try_reserve_slot(node_id)
            .then_some(Self { scheduler, node_id })
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.release_slot(self.node_id);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::harness;
    use chrono::Utc;
    use pulse_core::{new_entity_id, MessageType, NodeCapabilities};
    use pulse_test_utils::fixtures;
    use pulse_transport::InboundStream;
    use serde_json::json;
    use std::time::Duration;

    fn from_tablet(payload: MessagePayload) -> SwarmMessage {
        SwarmMessage::new("tablet", payload)
    }

    async fn next_message(inbox: &mut InboundStream) -> SwarmMessage {
        match tokio::time::timeout(Duration::from_secs(2), inbox.next()).await {
            Ok(Some(Inbound::Message(message))) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    async fn assert_quiet(inbox: &mut InboundStream) {
        let next = tokio::time::timeout(Duration::from_millis(30), inbox.next()).await;
        assert!(next.is_err(), "unexpected traffic: {next:?}");
    }

    #[tokio::test]
    async fn test_cache_query_is_answered() {
        let h = harness("phone", fixtures::phone_capabilities());
        let mut tablet = h.add_silent_peer("tablet", fixtures::npu_capabilities());
        h.scheduler
            .cache()
            .store("what is rust", None, "a systems language", 0.9);

        let query_id = new_entity_id();
        h.scheduler
            .handle_message(
                from_tablet(MessagePayload::CacheQuery {
                    query_id,
                    query: "what is rust".to_string(),
                    embedding: None,
                })
                .to("phone"),
            )
            .await;

        match next_message(&mut tablet).await.payload {
            MessagePayload::CacheResponse {
                query_id: answered,
                entry: Some(entry),
                ..
            } => {
                assert_eq!(answered, query_id);
                assert_eq!(entry.answer, "a systems language");
            }
            other => panic!("expected cache response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shared_entries_and_knowledge_land_in_cache() {
        let h = harness("phone", fixtures::phone_capabilities());
        h.add_peer("tablet", fixtures::npu_capabilities());
        let shared = SemanticCacheEntry::new("capital of france", "Paris", 0.9, "tablet");
        h.scheduler
            .handle_message(from_tablet(MessagePayload::CacheShare {
                entries: vec![shared.clone(), shared],
            }))
            .await;
        assert_eq!(h.scheduler.cache().len(), 1);

        let item = KnowledgeItem {
            id: new_entity_id(),
            topic: "boiling point of water".to_string(),
            content: "100 C at sea level".to_string(),
            confidence: 0.8,
            source_node: "tablet".to_string(),
            created_at: Utc::now(),
        };
        for _ in 0..2 {
            h.scheduler
                .handle_message(from_tablet(MessagePayload::KnowledgeSync {
                    items: vec![item.clone()],
                }))
                .await;
        }
        assert_eq!(h.scheduler.cache().len(), 2);
        assert_eq!(h.scheduler.cache().stats().network_entries, 2);
    }

    #[tokio::test]
    async fn test_repeated_violations_erode_relation() {
        let h = harness("phone", fixtures::phone_capabilities());
        h.scheduler
            .relations()
            .record_collaboration(&pulse_relation::CollaborationEvent::new(
                "tablet",
                TaskType::TextGeneration,
                true,
                0.9,
                100,
            ));
        let before = h.scheduler.relations().strength("tablet");

        for _ in 0..3 {
            h.scheduler
                .handle_inbound(Inbound::Violation {
                    peer_id: Some("tablet".to_string()),
                    error: ProtocolError::ChecksumMismatch { expected: 1, got: 2 },
                })
                .await;
        }
        assert_eq!(h.scheduler.registry().violation_count("tablet"), 3);
        assert!(h.scheduler.relations().strength("tablet") < before);
    }

    #[tokio::test]
    async fn test_mismatched_payload_is_a_violation() {
        let h = harness("phone", fixtures::phone_capabilities());
        h.add_peer("tablet", fixtures::npu_capabilities());
        let mut message = from_tablet(MessagePayload::CapabilityUpdate {
            capabilities: fixtures::low_memory_capabilities(),
        });
        message.message_type = MessageType::NodeHeartbeat;

        h.scheduler.handle_message(message).await;
        assert_eq!(h.scheduler.registry().violation_count("tablet"), 1);
        let peer = h.scheduler.registry().get("tablet").unwrap();
        assert!(peer.capabilities.has_npu);
    }

    #[tokio::test]
    async fn test_capability_update_only_for_recipient() {
        let h = harness("phone", fixtures::phone_capabilities());
        h.add_peer("tablet", fixtures::npu_capabilities());
        let update = || MessagePayload::CapabilityUpdate {
            capabilities: fixtures::low_memory_capabilities(),
        };

        h.scheduler.handle_message(from_tablet(update()).to("laptop")).await;
        assert!(h.scheduler.registry().get("tablet").unwrap().capabilities.has_npu);

        h.scheduler.handle_message(from_tablet(update())).await;
        let capabilities: NodeCapabilities = h.scheduler.registry().get("tablet").unwrap().capabilities;
        assert_eq!(capabilities, fixtures::low_memory_capabilities());
    }

    #[tokio::test]
    async fn test_announce_heartbeat_and_leave() {
        let h = harness("phone", fixtures::phone_capabilities());
        h.scheduler
            .handle_message(from_tablet(MessagePayload::NodeAnnounce(NodeAnnouncement {
                node_id: "tablet".to_string(),
                display_name: "Tablet".to_string(),
                address: fixtures::addr(9100),
                capabilities: fixtures::npu_capabilities(),
            })))
            .await;
        assert_eq!(h.scheduler.registry().get("tablet").unwrap().display_name, "Tablet");

        h.scheduler
            .handle_message(from_tablet(MessagePayload::NodeHeartbeat {
                load: 0.7,
                available_memory_mb: 4096,
                active_tasks: 2,
            }))
            .await;
        assert!((h.scheduler.network_state().average_load - 0.7).abs() < 1e-9);
        assert!(h.scheduler.predictor().node_history("tablet").is_some());

        h.scheduler
            .handle_message(from_tablet(MessagePayload::NodeLeave {
                reason: Some("battery".to_string()),
            }))
            .await;
        assert!(!h.scheduler.registry().contains("tablet"));
        assert!(h.scheduler.predictor().node_history("tablet").is_none());
        assert_eq!(h.scheduler.stats().known_peers, 0);
    }

    #[tokio::test]
    async fn test_serves_peer_task_request() {
        let h = harness("phone", fixtures::phone_capabilities());
        let mut tablet = h.add_silent_peer("tablet", fixtures::npu_capabilities());
        let task_id = new_entity_id();

        h.scheduler
            .handle_message(
                from_tablet(MessagePayload::TaskRequest {
                    task_id,
                    request: fixtures::text_request("hello phone"),
                })
                .to("phone"),
            )
            .await;

        let status = next_message(&mut tablet).await;
        assert!(matches!(
            status.payload,
            MessagePayload::TaskStatus { status: TaskStatus::Running, .. }
        ));
        match next_message(&mut tablet).await.payload {
            MessagePayload::TaskResponse(outcome) => {
                assert!(outcome.success);
                assert_eq!(outcome.task_id, task_id);
                assert_eq!(outcome.result, Some(json!({ "answer": "Echo: hello phone" })));
            }
            other => panic!("expected task response, got {other:?}"),
        }
        assert_eq!(h.scheduler.evolution().total_experience(), 10);
        assert_eq!(h.scheduler.slots_in_use("phone"), 0);
        assert_eq!(h.scheduler.served_count(), 0);
    }

    #[tokio::test]
    async fn test_governor_denial_is_reported_to_requester() {
        let h = harness("phone", fixtures::phone_capabilities());
        let mut tablet = h.add_silent_peer("tablet", fixtures::npu_capabilities());
        h.governor.set_decision(GovernorDecision::Denied {
            reason: "thermal throttling".to_string(),
        });

        h.scheduler
            .handle_message(from_tablet(MessagePayload::TaskRequest {
                task_id: new_entity_id(),
                request: fixtures::text_request("hello phone"),
            }))
            .await;

        match next_message(&mut tablet).await.payload {
            MessagePayload::TaskResponse(outcome) => {
                assert!(!outcome.success);
                assert_eq!(outcome.error.as_deref(), Some("thermal throttling"));
            }
            other => panic!("expected task response, got {other:?}"),
        }
        assert_eq!(h.inference.calls(), 0);
        assert_eq!(h.scheduler.slots_in_use("phone"), 0);
    }

    #[tokio::test]
    async fn test_gossip_is_relayed_once() {
        let h = harness("phone", fixtures::phone_capabilities());
        let mut tablet = h.add_silent_peer("tablet", fixtures::npu_capabilities());
        let mut laptop = h.add_silent_peer("laptop", fixtures::npu_capabilities());
        let gossip = from_tablet(MessagePayload::Gossip {
            topic: "weather".to_string(),
            data: json!({ "rain": true }),
        });

        h.scheduler.handle_message(gossip.clone()).await;
        h.scheduler.handle_message(gossip.clone()).await;

        let forwarded = next_message(&mut laptop).await;
        assert_eq!(forwarded.id, gossip.id);
        assert_eq!(forwarded.ttl, gossip.ttl - 1);
        assert_quiet(&mut laptop).await;
        assert_quiet(&mut tablet).await;
    }

    #[tokio::test]
    async fn test_observation_gossip_teaches_about_third_party() {
        let h = harness("phone", fixtures::phone_capabilities());
        h.add_peer("tablet", fixtures::npu_capabilities());
        let observation = MirrorObservation::new("laptop", TaskType::Summarization, ObservedOutcome::Optimal, 0.9);

        h.scheduler
            .handle_message(from_tablet(MessagePayload::Gossip {
                topic: OBSERVATION_TOPIC.to_string(),
                data: serde_json::to_value(&observation).unwrap(),
            }))
            .await;

        let relation = h.scheduler.relations().get("laptop").unwrap();
        assert_eq!(relation.mirror_observations, 1);
        assert_eq!(relation.collaboration_count, 0);
    }

    #[tokio::test]
    async fn test_own_messages_are_ignored() {
        let h = harness("phone", fixtures::phone_capabilities());
        h.scheduler
            .handle_message(SwarmMessage::new(
                "phone",
                MessagePayload::NodeHeartbeat {
                    load: 1.0,
                    available_memory_mb: 0,
                    active_tasks: 9,
                },
            ))
            .await;
        assert!(h.scheduler.predictor().node_history("phone").is_none());
    }
}
