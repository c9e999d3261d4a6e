//! Wire envelope exchanged between peers

use crate::{
    new_entity_id, Embedding, EntityId, MessageId, NodeCapabilities, NodeId, Priority,
    SemanticCacheEntry, TaskId, TaskStatus, TaskSubmitRequest, Timestamp,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Hop budget given to freshly created messages.
pub const DEFAULT_TTL: u8 = 3;

/// Discriminant of a [`SwarmMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    NodeAnnounce,
    NodeHeartbeat,
    NodeLeave,
    TaskRequest,
    TaskResponse,
    TaskStatus,
    TaskCancel,
    CacheShare,
    CacheQuery,
    CacheResponse,
    KnowledgeSync,
    CapabilityUpdate,
    Gossip,
}

impl MessageType {
    pub const ALL: [MessageType; 13] = [
        MessageType::NodeAnnounce,
        MessageType::NodeHeartbeat,
        MessageType::NodeLeave,
        MessageType::TaskRequest,
        MessageType::TaskResponse,
        MessageType::TaskStatus,
        MessageType::TaskCancel,
        MessageType::CacheShare,
        MessageType::CacheQuery,
        MessageType::CacheResponse,
        MessageType::KnowledgeSync,
        MessageType::CapabilityUpdate,
        MessageType::Gossip,
    ];
}

/// Identity a node publishes when it joins or re-announces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub node_id: NodeId,
    pub display_name: String,
    pub address: SocketAddr,
    pub capabilities: NodeCapabilities,
}

/// Outcome of a task executed on behalf of a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub processing_time_ms: u64,
    /// Self-reported quality in [0, 1]
    pub quality: f64,
}

/// A unit of learned knowledge shared between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: EntityId,
    pub topic: String,
    pub content: String,
    pub confidence: f64,
    pub source_node: NodeId,
    pub created_at: Timestamp,
}

/// Payload of a [`SwarmMessage`], one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum MessagePayload {
    NodeAnnounce(NodeAnnouncement),
    NodeHeartbeat {
        /// Current load in [0, 1]
        load: f64,
        available_memory_mb: u64,
        active_tasks: u32,
    },
    NodeLeave {
        reason: Option<String>,
    },
    TaskRequest {
        task_id: TaskId,
        request: TaskSubmitRequest,
    },
    TaskResponse(TaskOutcome),
    TaskStatus {
        task_id: TaskId,
        status: TaskStatus,
        progress: f64,
    },
    TaskCancel {
        task_id: TaskId,
        reason: Option<String>,
    },
    CacheShare {
        entries: Vec<SemanticCacheEntry>,
    },
    CacheQuery {
        query_id: EntityId,
        query: String,
        embedding: Option<Embedding>,
    },
    CacheResponse {
        query_id: EntityId,
        entry: Option<SemanticCacheEntry>,
        similarity: f64,
    },
    KnowledgeSync {
        items: Vec<KnowledgeItem>,
    },
    CapabilityUpdate {
        capabilities: NodeCapabilities,
    },
    Gossip {
        topic: String,
        data: serde_json::Value,
    },
}

impl MessagePayload {
    /// The message type this payload belongs to.
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::NodeAnnounce(_) => MessageType::NodeAnnounce,
            MessagePayload::NodeHeartbeat { .. } => MessageType::NodeHeartbeat,
            MessagePayload::NodeLeave { .. } => MessageType::NodeLeave,
            MessagePayload::TaskRequest { .. } => MessageType::TaskRequest,
            MessagePayload::TaskResponse(_) => MessageType::TaskResponse,
            MessagePayload::TaskStatus { .. } => MessageType::TaskStatus,
            MessagePayload::TaskCancel { .. } => MessageType::TaskCancel,
            MessagePayload::CacheShare { .. } => MessageType::CacheShare,
            MessagePayload::CacheQuery { .. } => MessageType::CacheQuery,
            MessagePayload::CacheResponse { .. } => MessageType::CacheResponse,
            MessagePayload::KnowledgeSync { .. } => MessageType::KnowledgeSync,
            MessagePayload::CapabilityUpdate { .. } => MessageType::CapabilityUpdate,
            MessagePayload::Gossip { .. } => MessageType::Gossip,
        }
    }
}

/// Envelope for every message exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmMessage {
    pub id: MessageId,
    pub message_type: MessageType,
    pub sender_id: NodeId,
    /// `None` means broadcast
    pub recipient_id: Option<NodeId>,
    pub timestamp: Timestamp,
    /// Remaining hop budget
    pub ttl: u8,
    pub priority: Priority,
    pub payload: MessagePayload,
}

impl SwarmMessage {
    /// Create a broadcast message whose type is derived from the payload.
    pub fn new(sender_id: impl Into<NodeId>, payload: MessagePayload) -> Self {
        Self {
            id: new_entity_id(),
            message_type: payload.message_type(),
            sender_id: sender_id.into(),
            recipient_id: None,
            timestamp: Utc::now(),
            ttl: DEFAULT_TTL,
            priority: Priority::Normal,
            payload,
        }
    }

    /// Address the message to a single peer.
    pub fn to(mut self, recipient: impl Into<NodeId>) -> Self {
        self.recipient_id = Some(recipient.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }

    /// Whether the declared type agrees with the payload variant.
    pub fn payload_matches_type(&self) -> bool {
        self.payload.message_type() == self.message_type
    }

    /// Copy of this message for the next hop, or `None` when the hop budget
    /// is spent. A relayed message always carries `ttl >= 1`.
    pub fn relayed(&self) -> Option<SwarmMessage> {
        let ttl = self.ttl.checked_sub(1).filter(|t| *t > 0)?;
        Some(SwarmMessage {
            ttl,
            ..self.clone()
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskType;
    use serde_json::json;

    #[test]
    fn test_new_derives_type_from_payload() {
        let msg = SwarmMessage::new(
            "phone",
            MessagePayload::NodeLeave {
                reason: Some("shutdown".to_string()),
            },
        );
        assert_eq!(msg.message_type, MessageType::NodeLeave);
        assert_eq!(msg.ttl, DEFAULT_TTL);
        assert!(msg.is_broadcast());
        assert!(msg.payload_matches_type());
    }

    #[test]
    fn test_mismatched_type_is_detected() {
        let mut msg = SwarmMessage::new(
            "phone",
            MessagePayload::Gossip {
                topic: "t".to_string(),
                data: json!(null),
            },
        );
        msg.message_type = MessageType::TaskCancel;
        assert!(!msg.payload_matches_type());
    }

    #[test]
    fn test_relayed_decrements_ttl() {
        let msg = SwarmMessage::new(
            "phone",
            MessagePayload::Gossip {
                topic: "t".to_string(),
                data: json!({"x": 1}),
            },
        );
        let hop1 = msg.relayed().unwrap();
        assert_eq!(hop1.ttl, 2);
        assert_eq!(hop1.id, msg.id);
        let hop2 = hop1.relayed().unwrap();
        assert_eq!(hop2.ttl, 1);
        assert!(hop2.relayed().is_none());
        assert!(msg.clone().with_ttl(0).relayed().is_none());
    }

    #[test]
    fn test_task_request_json_roundtrip() {
        let request = TaskSubmitRequest::new(TaskType::Summarization, json!({"prompt": "x"}));
        let msg = SwarmMessage::new(
            "tablet",
            MessagePayload::TaskRequest {
                task_id: new_entity_id(),
                request,
            },
        )
        .to("phone")
        .with_priority(Priority::High);

        let json = serde_json::to_string(&msg).unwrap();
        let back: SwarmMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_payload_is_adjacently_tagged() {
        let payload = MessagePayload::TaskCancel {
            task_id: uuid::Uuid::nil(),
            reason: None,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "TaskCancel");
        assert!(value["data"].is_object());
    }
}
