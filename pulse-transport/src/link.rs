//! Transport seams: outbound links, connectors and the inbound stream

use async_trait::async_trait;
use pulse_core::{NodeId, PeerNode, ProtocolError, SwarmMessage, SwarmResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// An established outbound connection to one peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Send one message. Any failure invalidates the link.
    async fn send(&self, message: &SwarmMessage) -> SwarmResult<()>;
}

/// Opens links to peers on demand.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, peer: &PeerNode) -> SwarmResult<Arc<dyn PeerLink>>;
}

/// Something that arrived from the network.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(SwarmMessage),
    /// A frame that failed validation. `peer_id` is the last sender seen on
    /// the same connection, if any.
    Violation {
        peer_id: Option<NodeId>,
        error: ProtocolError,
    },
}

pub type InboundSender = mpsc::UnboundedSender<Inbound>;
pub type InboundStream = UnboundedReceiverStream<Inbound>;

/// Create the unbounded inbound channel transports feed into.
pub fn inbound_channel() -> (InboundSender, InboundStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, UnboundedReceiverStream::new(rx))
}
