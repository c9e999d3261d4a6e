//! Peer registry: the authoritative local view of the swarm
//!
//! Peers, cached links and violation counters live in separate `DashMap`s so
//! that the receive loop, the maintenance job and scheduling calls only ever
//! contend on single keys. Links are never held across an `.await` while a
//! shard lock is taken.

use crate::{DiscoveryEvent, PeerConnector, PeerLink};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use pulse_core::{
    ConnectionState, MessageId, NodeCapabilities, NodeId, PeerNode, SwarmError, SwarmMessage,
    SwarmResult, Timestamp, TransportConfig, TransportError,
};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// Per-peer outcome of a broadcast.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<(NodeId, SwarmError)>,
}

impl BroadcastReport {
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

/// What happened to a message handed to [`PeerRegistry::relay`].
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Forwarded(BroadcastReport),
    /// Already relayed once
    Duplicate,
    /// Hop budget spent
    TtlExpired,
}

/// Bounded FIFO set of recently seen message ids.
#[derive(Debug)]
struct SeenSet {
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns `true` when `id` was not seen before.
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

/// Local view of discovered and connected peers.
pub struct PeerRegistry {
    local_id: NodeId,
    config: TransportConfig,
    connector: Arc<dyn PeerConnector>,
    peers: DashMap<NodeId, PeerNode>,
    links: DashMap<NodeId, Arc<dyn PeerLink>>,
    violations: DashMap<NodeId, u32>,
    seen: Mutex<SeenSet>,
    observers: watch::Sender<Vec<PeerNode>>,
}

impl PeerRegistry {
    pub fn new(config: TransportConfig, connector: Arc<dyn PeerConnector>) -> Self {
        let (observers, _) = watch::channel(Vec::new());
        Self {
            local_id: config.node_id.clone(),
            seen: Mutex::new(SeenSet::new(config.seen_capacity)),
            config,
            connector,
            peers: DashMap::new(),
            links: DashMap::new(),
            violations: DashMap::new(),
            observers,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Peer bookkeeping
    // ------------------------------------------------------------------------

    /// Insert a newly discovered peer or refresh a known one.
    ///
    /// Returns `true` when the peer was not known before. A changed address
    /// drops the cached link.
    pub fn upsert(&self, peer: PeerNode) -> bool {
        if peer.id == self.local_id {
            return false;
        }
        let peer_id = peer.id.clone();
        let mut address_changed = false;
        let is_new = match self.peers.entry(peer_id.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                address_changed = existing.address != peer.address;
                existing.address = peer.address;
                existing.display_name = peer.display_name;
                existing.capabilities = peer.capabilities;
                existing.touch();
                false
            }
            Entry::Vacant(entry) => {
                info!(peer_id = %peer_id, address = %peer.address, "Discovered peer");
                entry.insert(peer);
                true
            }
        };
        if address_changed {
            debug!(peer_id = %peer_id, "Peer address changed, dropping cached link");
            self.links.remove(&peer_id);
        }
        self.publish();
        is_new
    }

    /// Apply one discovery event.
    pub fn apply_discovery(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Found(peer) | DiscoveryEvent::Updated(peer) => {
                self.upsert(peer);
            }
            DiscoveryEvent::Lost(peer_id) => {
                if self.remove(&peer_id).is_some() {
                    info!(peer_id = %peer_id, "Peer lost");
                }
            }
            DiscoveryEvent::DiscoveryFailed { reason } => {
                warn!(reason = %reason, "Discovery failed");
            }
        }
    }

    /// Forget a peer, its cached link and its violation tally.
    pub fn remove(&self, peer_id: &str) -> Option<PeerNode> {
        self.links.remove(peer_id);
        self.violations.remove(peer_id);
        let removed = self.peers.remove(peer_id).map(|(_, peer)| peer);
        if removed.is_some() {
            self.publish();
        }
        removed
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerNode> {
        self.peers.get(peer_id).map(|p| p.value().clone())
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Snapshot of all peers, ordered by id.
    pub fn peers(&self) -> Vec<PeerNode> {
        let mut peers: Vec<PeerNode> = self.peers.iter().map(|p| p.value().clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Mark a peer as seen. Returns `false` for unknown peers.
    pub fn touch(&self, peer_id: &str) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut peer) => {
                peer.touch();
                true
            }
            None => false,
        }
    }

    /// Replace a peer's advertised capabilities.
    pub fn update_capabilities(&self, peer_id: &str, capabilities: NodeCapabilities) -> bool {
        let updated = match self.peers.get_mut(peer_id) {
            Some(mut peer) => {
                peer.capabilities = capabilities;
                peer.touch();
                true
            }
            None => false,
        };
        if updated {
            self.publish();
        }
        updated
    }

    /// Evict peers silent for longer than `max_silence`.
    pub fn evict_silent(&self, max_silence: Duration, now: Timestamp) -> Vec<NodeId> {
        let candidates: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|p| p.is_silent(max_silence, now))
            .map(|p| p.key().clone())
            .collect();

        let mut evicted = Vec::new();
        for peer_id in candidates {
            // re-checked under the entry lock; a concurrent touch wins
            if self
                .peers
                .remove_if(&peer_id, |_, p| p.is_silent(max_silence, now))
                .is_some()
            {
                self.links.remove(&peer_id);
                self.violations.remove(&peer_id);
                info!(peer_id = %peer_id, silence_secs = max_silence.as_secs(), "Evicted silent peer");
                evicted.push(peer_id);
            }
        }
        if !evicted.is_empty() {
            self.publish();
        }
        evicted
    }

    /// Count a protocol violation. Returns the running total for the peer.
    pub fn record_violation(&self, peer_id: &str) -> u32 {
        let mut count = self.violations.entry(peer_id.to_string()).or_insert(0);
        *count += 1;
        warn!(peer_id, violations = *count, "Protocol violation");
        *count
    }

    pub fn violation_count(&self, peer_id: &str) -> u32 {
        self.violations.get(peer_id).map(|c| *c).unwrap_or(0)
    }

    /// Remember `id`. Returns `true` when it had not been seen before.
    pub fn mark_seen(&self, id: MessageId) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id)
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    /// Send `message` to one peer.
    ///
    /// The link is established lazily and cached. A failed send drops the
    /// cached link so the next attempt reconnects. No retries happen here.
    pub async fn send(&self, peer_id: &str, message: &SwarmMessage) -> SwarmResult<()> {
        let link = self.link_for(peer_id).await?;
        match link.send(message).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.links.remove(peer_id);
                self.set_state(peer_id, ConnectionState::Disconnected);
                warn!(
                    peer_id,
                    message_type = ?message.message_type,
                    error = %err,
                    "Send failed, link invalidated"
                );
                Err(err)
            }
        }
    }

    /// Send to every known peer.
    pub async fn broadcast(&self, message: &SwarmMessage) -> BroadcastReport {
        self.broadcast_except(message, &[]).await
    }

    /// Send to every known peer not listed in `exclude`.
    pub async fn broadcast_except(&self, message: &SwarmMessage, exclude: &[&str]) -> BroadcastReport {
        let mut targets: Vec<NodeId> = self
            .peers
            .iter()
            .map(|p| p.key().clone())
            .filter(|id| !exclude.contains(&id.as_str()))
            .collect();
        targets.sort();

        let results = join_all(targets.iter().map(|id| self.send(id, message))).await;

        let mut report = BroadcastReport::default();
        for (peer_id, result) in targets.into_iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(err) => report.failed.push((peer_id, err)),
            }
        }
        debug!(
            message_type = ?message.message_type,
            delivered = report.delivered,
            failed = report.failed_count(),
            "Broadcast complete"
        );
        report
    }

    /// Forward a broadcast message one more hop.
    ///
    /// The ttl is decremented first; a message left with no hop budget is
    /// dropped. Each message id is relayed at most once and never back to its
    /// original sender.
    pub async fn relay(&self, message: &SwarmMessage) -> RelayOutcome {
        if !self.mark_seen(message.id) {
            return RelayOutcome::Duplicate;
        }
        let Some(next) = message.relayed() else {
            debug!(message_id = %message.id, "Dropping message with spent ttl");
            return RelayOutcome::TtlExpired;
        };
        let report = self
            .broadcast_except(&next, &[message.sender_id.as_str()])
            .await;
        RelayOutcome::Forwarded(report)
    }

    async fn link_for(&self, peer_id: &str) -> SwarmResult<Arc<dyn PeerLink>> {
        if let Some(link) = self.links.get(peer_id) {
            return Ok(Arc::clone(link.value()));
        }
        let peer = self.get(peer_id).ok_or_else(|| TransportError::PeerUnknown {
            peer_id: peer_id.to_string(),
        })?;

        self.set_state(peer_id, ConnectionState::Connecting);
        match self.connector.connect(&peer).await {
            Ok(link) => {
                self.links.insert(peer_id.to_string(), Arc::clone(&link));
                self.set_state(peer_id, ConnectionState::Connected);
                debug!(peer_id, address = %peer.address, "Connected to peer");
                Ok(link)
            }
            Err(err) => {
                self.set_state(peer_id, ConnectionState::Unreachable);
                warn!(peer_id, address = %peer.address, error = %err, "Connect failed");
                Err(err)
            }
        }
    }

    fn set_state(&self, peer_id: &str, state: ConnectionState) {
        let changed = match self.peers.get_mut(peer_id) {
            Some(mut peer) if peer.state != state => {
                peer.state = state;
                true
            }
            _ => false,
        };
        if changed {
            self.publish();
        }
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    /// Latest-value stream of the peer list.
    pub fn peer_updates(&self) -> WatchStream<Vec<PeerNode>> {
        WatchStream::new(self.observers.subscribe())
    }

    fn publish(&self) {
        self.observers.send_replace(self.peers());
    }

    /// Number of peers with an open link.
    pub fn connected_count(&self) -> usize {
        self.links.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
