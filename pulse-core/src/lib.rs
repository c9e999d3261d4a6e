//! PULSE Core - Shared Vocabulary
//!
//! Data structures shared by every component of the swarm: identities,
//! peers, the wire envelope, tasks, cache entries, errors, configuration and
//! the traits through which the core talks to its external collaborators
//! (resource governor, inference runtime).

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod cache_entry;
pub mod collaborator;
pub mod config;
pub mod embedding;
pub mod error;
pub mod message;
pub mod node;
pub mod task;

pub use cache_entry::*;
pub use collaborator::*;
pub use config::*;
pub use embedding::*;
pub use error::*;
pub use message::*;
pub use node::*;
pub use task::*;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

/// Identifier of a device in the swarm.
///
/// Peer ids come from the discovery layer and are opaque strings (service
/// instance names, hardware ids, ...), so they are not forced into a UUID.
pub type NodeId = String;

/// Identifier of a submitted task.
pub type TaskId = Uuid;

/// Identifier of a wire message.
pub type MessageId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// Hours elapsed between `earlier` and `now`, never negative.
///
/// Clock skew between peers can put a peer-reported timestamp in the future;
/// such ages are clamped to zero rather than producing a score boost.
pub fn age_hours(earlier: Timestamp, now: Timestamp) -> f64 {
    let millis = now.signed_duration_since(earlier).num_milliseconds();
    (millis.max(0) as f64) / 3_600_000.0
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entity_id_is_v7() {
        let id = new_entity_id();
        assert_eq!(id.get_version_num(), 7);
    }

    #[test]
    fn test_age_hours_is_clamped() {
        let now = Utc::now();
        let future = now + chrono::Duration::hours(3);
        assert_eq!(age_hours(future, now), 0.0);
    }

    #[test]
    fn test_age_hours_counts_fractional_hours() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::minutes(90);
        assert!((age_hours(earlier, now) - 1.5).abs() < 1e-9);
    }
}
