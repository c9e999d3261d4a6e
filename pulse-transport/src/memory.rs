//! In-process transport for tests and simulations
//!
//! Every message still goes through the frame codec so that simulated swarms
//! exercise the same validation as the TCP transport.

use crate::codec::{decode_frame, encode_frame};
use crate::{inbound_channel, Inbound, InboundSender, InboundStream, PeerConnector, PeerLink};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use pulse_core::{NodeId, PeerNode, SwarmMessage, SwarmResult, TransportError, MAX_FRAME_BYTES};
use std::sync::Arc;

#[derive(Default)]
struct Hub {
    mailboxes: DashMap<NodeId, InboundSender>,
    partitioned: DashSet<NodeId>,
}

/// A simulated local network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node. Returns its connector and inbound stream.
    pub fn join(&self, node_id: impl Into<NodeId>) -> (MemoryConnector, InboundStream) {
        let node_id = node_id.into();
        let (tx, rx) = inbound_channel();
        self.hub.mailboxes.insert(node_id.clone(), tx);
        let connector = MemoryConnector {
            local_id: node_id,
            hub: Arc::clone(&self.hub),
        };
        (connector, rx)
    }

    /// Detach a node; sends to it fail with a connection reset.
    pub fn leave(&self, node_id: &str) {
        self.hub.mailboxes.remove(node_id);
    }

    /// Cut a node off without detaching it.
    pub fn partition(&self, node_id: impl Into<NodeId>) {
        self.hub.partitioned.insert(node_id.into());
    }

    pub fn heal(&self, node_id: &str) {
        self.hub.partitioned.remove(node_id);
    }

    /// Inject an already-encoded frame as if `node_id` had received it.
    pub fn inject_frame(&self, node_id: &str, from: Option<NodeId>, frame: &[u8]) -> bool {
        let Some(mailbox) = self.hub.mailboxes.get(node_id).map(|m| m.value().clone()) else {
            return false;
        };
        let inbound = match decode_frame(frame, MAX_FRAME_BYTES) {
            Ok(message) => Inbound::Message(message),
            Err(error) => Inbound::Violation {
                peer_id: from,
                error,
            },
        };
        mailbox.send(inbound).is_ok()
    }
}

/// Connector bound to one simulated node.
pub struct MemoryConnector {
    local_id: NodeId,
    hub: Arc<Hub>,
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn connect(&self, peer: &PeerNode) -> SwarmResult<Arc<dyn PeerLink>> {
        if self.hub.partitioned.contains(&peer.id) || self.hub.partitioned.contains(&self.local_id)
        {
            return Err(TransportError::Unreachable {
                peer_id: peer.id.clone(),
                reason: "network partitioned".to_string(),
            }
            .into());
        }
        if !self.hub.mailboxes.contains_key(&peer.id) {
            return Err(TransportError::Unreachable {
                peer_id: peer.id.clone(),
                reason: "no such node".to_string(),
            }
            .into());
        }
        Ok(Arc::new(MemoryLink {
            local_id: self.local_id.clone(),
            peer_id: peer.id.clone(),
            hub: Arc::clone(&self.hub),
        }))
    }
}

struct MemoryLink {
    local_id: NodeId,
    peer_id: NodeId,
    hub: Arc<Hub>,
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn send(&self, message: &SwarmMessage) -> SwarmResult<()> {
        if self.hub.partitioned.contains(&self.peer_id)
            || self.hub.partitioned.contains(&self.local_id)
        {
            return Err(TransportError::Retryable {
                peer_id: self.peer_id.clone(),
                reason: "network partitioned".to_string(),
            }
            .into());
        }
        let reset = || TransportError::ConnectionReset {
            peer_id: self.peer_id.clone(),
            reason: "peer left".to_string(),
        };
        let mailbox = self
            .hub
            .mailboxes
            .get(&self.peer_id)
            .map(|m| m.value().clone())
            .ok_or_else(reset)?;

        let frame = encode_frame(message, MAX_FRAME_BYTES)?;
        let delivered = decode_frame(&frame, MAX_FRAME_BYTES)?;
        mailbox
            .send(Inbound::Message(delivered))
            .map_err(|_| reset().into())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerRegistry;
    use futures_util::StreamExt;
    use pulse_core::{MessagePayload, NodeCapabilities, ProtocolError, TransportConfig};

    fn registry_for(net: &MemoryNetwork, id: &str) -> (PeerRegistry, InboundStream) {
        let (connector, inbound) = net.join(id);
        let config = TransportConfig {
            node_id: id.to_string(),
            ..Default::default()
        };
        (PeerRegistry::new(config, Arc::new(connector)), inbound)
    }

    fn node(id: &str) -> PeerNode {
        PeerNode::new(id, "127.0.0.1:37373".parse().unwrap(), NodeCapabilities::default())
    }

    #[tokio::test]
    async fn test_message_delivered_between_nodes() {
        let net = MemoryNetwork::new();
        let (a, _a_in) = registry_for(&net, "a");
        let (_b, mut b_in) = registry_for(&net, "b");
        a.upsert(node("b"));

        let msg = SwarmMessage::new("a", MessagePayload::NodeLeave { reason: None }).to("b");
        a.send("b", &msg).await.unwrap();
        assert_eq!(b_in.next().await, Some(Inbound::Message(msg)));
    }

    #[tokio::test]
    async fn test_partition_fails_sends() {
        let net = MemoryNetwork::new();
        let (a, _a_in) = registry_for(&net, "a");
        let (_b, _b_in) = registry_for(&net, "b");
        a.upsert(node("b"));
        net.partition("b");

        let msg = SwarmMessage::new("a", MessagePayload::NodeLeave { reason: None });
        let err = a.send("b", &msg).await.unwrap_err();
        assert!(err.is_retryable());

        net.heal("b");
        a.send("b", &msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_left_node_resets_connection() {
        let net = MemoryNetwork::new();
        let (a, _a_in) = registry_for(&net, "a");
        let (_b, _b_in) = registry_for(&net, "b");
        a.upsert(node("b"));
        let msg = SwarmMessage::new("a", MessagePayload::NodeLeave { reason: None });
        a.send("b", &msg).await.unwrap();

        net.leave("b");
        let err = a.send("b", &msg).await.unwrap_err();
        assert!(matches!(
            err,
            pulse_core::SwarmError::Transport(TransportError::ConnectionReset { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_corrupt_frame_becomes_violation() {
        let net = MemoryNetwork::new();
        let (_b, mut b_in) = registry_for(&net, "b");
        let msg = SwarmMessage::new("a", MessagePayload::NodeLeave { reason: None });
        let mut frame = encode_frame(&msg, MAX_FRAME_BYTES).unwrap();
        frame[2] = 7;

        assert!(net.inject_frame("b", Some("a".to_string()), &frame));
        match b_in.next().await {
            Some(Inbound::Violation { peer_id, error }) => {
                assert_eq!(peer_id.as_deref(), Some("a"));
                assert_eq!(error, ProtocolError::UnsupportedVersion { version: 7 });
            }
            other => panic!("expected violation, got {other:?}"),
        }
    }
}
