//! Peer node types

use crate::{NodeId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Kind of model a device can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelType {
    /// Causal language model (text generation)
    Llm,
    /// Sentence embedding model
    Embedding,
    /// Speech-to-text model
    Speech,
    /// Image understanding model
    Vision,
}

/// Hardware and runtime capabilities a node advertises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub has_npu: bool,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub supported_models: Vec<ModelType>,
    pub max_concurrent_tasks: u32,
    pub cpu_cores: u32,
    pub has_gpu: bool,
}

impl NodeCapabilities {
    /// Whether this node can run a model of the given type.
    pub fn supports(&self, model: ModelType) -> bool {
        self.supported_models.contains(&model)
    }

    /// Whether the hard requirements (memory, NPU) are satisfied.
    pub fn satisfies(&self, min_memory_mb: u64, requires_npu: bool) -> bool {
        self.available_memory_mb >= min_memory_mb && (!requires_npu || self.has_npu)
    }
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            has_npu: false,
            total_memory_mb: 4096,
            available_memory_mb: 2048,
            supported_models: vec![ModelType::Llm, ModelType::Embedding],
            max_concurrent_tasks: 2,
            cpu_cores: 8,
            has_gpu: false,
        }
    }
}

/// Connection lifecycle of a peer as seen from this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
    Unreachable,
}

/// A device in the swarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerNode {
    pub id: NodeId,
    pub address: SocketAddr,
    pub display_name: String,
    pub capabilities: NodeCapabilities,
    pub discovered_at: Timestamp,
    pub last_seen: Timestamp,
    pub state: ConnectionState,
}

impl PeerNode {
    /// Create a freshly discovered peer.
    pub fn new(id: impl Into<NodeId>, address: SocketAddr, capabilities: NodeCapabilities) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            display_name: id.clone(),
            id,
            address,
            capabilities,
            discovered_at: now,
            last_seen: now,
            state: ConnectionState::Discovered,
        }
    }

    /// Set the human-readable name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Update last-seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Whether the peer has been silent for longer than `max_silence`.
    pub fn is_silent(&self, max_silence: std::time::Duration, now: Timestamp) -> bool {
        let silence = now.signed_duration_since(self.last_seen);
        silence.to_std().map(|s| s > max_silence).unwrap_or(false)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "192.168.1.20:37373".parse().unwrap()
    }

    #[test]
    fn test_capabilities_satisfies() {
        let caps = NodeCapabilities {
            has_npu: false,
            available_memory_mb: 2048,
            ..Default::default()
        };
        assert!(caps.satisfies(1024, false));
        assert!(!caps.satisfies(4096, false));
        assert!(!caps.satisfies(1024, true));
    }

    #[test]
    fn test_peer_new_defaults() {
        let peer = PeerNode::new("tablet", addr(), NodeCapabilities::default());
        assert_eq!(peer.display_name, "tablet");
        assert_eq!(peer.state, ConnectionState::Discovered);
        assert_eq!(peer.discovered_at, peer.last_seen);
    }

    #[test]
    fn test_peer_is_silent() {
        let mut peer = PeerNode::new("phone", addr(), NodeCapabilities::default());
        let now = Utc::now();
        peer.last_seen = now - chrono::Duration::seconds(300);
        assert!(peer.is_silent(Duration::from_secs(120), now));
        assert!(!peer.is_silent(Duration::from_secs(600), now));
    }
}
