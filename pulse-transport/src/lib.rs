//! PULSE Transport - Peer Registry & Wire
//!
//! Owns the local view of discovered peers and moves typed, framed messages
//! to and from them. Retry policy is left to callers: every send failure is
//! reported, never retried or swallowed here.

pub mod codec;
pub mod discovery;
pub mod link;
pub mod memory;
pub mod registry;
pub mod tcp;

pub use codec::{decode_frame, encode_frame, read_frame, write_frame, CodecError};
pub use discovery::{follow_discovery, ChannelDiscovery, DiscoveryEvent, DiscoveryService};
pub use link::{inbound_channel, Inbound, InboundSender, InboundStream, PeerConnector, PeerLink};
pub use memory::{MemoryConnector, MemoryNetwork};
pub use registry::{BroadcastReport, PeerRegistry, RelayOutcome};
pub use tcp::{TcpConnector, TcpTransport};
