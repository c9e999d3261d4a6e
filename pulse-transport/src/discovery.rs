//! Local-network discovery abstraction
//!
//! The concrete mechanism (mDNS, Android NSD, static lists) is supplied by the
//! embedder. [`ChannelDiscovery`] lets it push events in from anywhere.

use crate::PeerRegistry;
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use pulse_core::{NodeAnnouncement, NodeId, PeerNode, SwarmResult};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

/// Something the discovery layer observed.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Found(PeerNode),
    Updated(PeerNode),
    Lost(NodeId),
    DiscoveryFailed { reason: String },
}

/// A local-network service discovery mechanism.
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    /// Publish this node's identity and capabilities.
    async fn announce(&self, announcement: &NodeAnnouncement) -> SwarmResult<()>;

    /// Lazy stream of discovery events. It does not terminate while the
    /// service is alive.
    fn discover(&self) -> BoxStream<'static, DiscoveryEvent>;
}

/// Discovery fed through channels by an external mechanism.
pub struct ChannelDiscovery {
    events: broadcast::Sender<DiscoveryEvent>,
    announced: watch::Sender<Option<NodeAnnouncement>>,
}

impl ChannelDiscovery {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (announced, _) = watch::channel(None);
        Self { events, announced }
    }

    /// Push an event to every current subscriber.
    pub fn emit(&self, event: DiscoveryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Number of live `discover()` streams.
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Watch what this node last announced, for the mechanism to publish.
    pub fn announcements(&self) -> watch::Receiver<Option<NodeAnnouncement>> {
        self.announced.subscribe()
    }
}

impl Default for ChannelDiscovery {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl DiscoveryService for ChannelDiscovery {
    async fn announce(&self, announcement: &NodeAnnouncement) -> SwarmResult<()> {
        info!(node_id = %announcement.node_id, address = %announcement.address, "Announcing node");
        self.announced.send_replace(Some(announcement.clone()));
        Ok(())
    }

    fn discover(&self) -> BoxStream<'static, DiscoveryEvent> {
        BroadcastStream::new(self.events.subscribe())
            .map(|item| match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => DiscoveryEvent::DiscoveryFailed {
                    reason: format!("discovery consumer lagged, {skipped} events skipped"),
                },
            })
            .boxed()
    }
}

/// Feed discovery events into the registry until shutdown or stream end.
pub async fn follow_discovery(
    registry: Arc<PeerRegistry>,
    discovery: Arc<dyn DiscoveryService>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut events = discovery.discover();
    loop {
        tokio::select! {
            next = events.next() => match next {
                Some(event) => registry.apply_discovery(event),
                None => {
                    warn!("Discovery stream ended");
                    break;
                }
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Discovery loop shutting down");
                    break;
                }
            }
        }
    }
}
