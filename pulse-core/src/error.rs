//! Error types for PULSE operations

use crate::{NodeId, TaskId};
use std::time::Duration;
use thiserror::Error;

/// Peer transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer unknown: {peer_id}")]
    PeerUnknown { peer_id: NodeId },

    #[error("Peer {peer_id} unreachable: {reason}")]
    Unreachable { peer_id: NodeId, reason: String },

    #[error("Connection to {peer_id} reset: {reason}")]
    ConnectionReset { peer_id: NodeId, reason: String },

    #[error("Transient failure talking to {peer_id}: {reason}")]
    Retryable { peer_id: NodeId, reason: String },

    #[error("Transport closed")]
    Closed,
}

/// Resource errors. Not retryable without renegotiated requirements.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Insufficient memory: required {required_mb}MB, available {available_mb}MB")]
    InsufficientMemory { required_mb: u64, available_mb: u64 },

    #[error("Task requires an NPU and none is available")]
    NpuRequired,

    #[error("Resource governor denied execution: {reason}")]
    GovernorDenied { reason: String },

    #[error("No capacity left on {node_id}")]
    CapacityExhausted { node_id: NodeId },
}

/// Wire protocol errors. The offending message is dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("Checksum mismatch: expected {expected:#010x}, got {got:#010x}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Unsupported wire version {version}")]
    UnsupportedVersion { version: u8 },

    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Payload does not match declared message type {declared}")]
    PayloadMismatch { declared: String },

    #[error("Failed to decode message: {reason}")]
    Decode { reason: String },
}

/// Timeout errors. Retried up to the task's retry budget.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("Task {task_id} exceeded its deadline of {timeout:?}")]
    TaskTimedOut { task_id: TaskId, timeout: Duration },

    #[error("No response from {peer_id} within {timeout:?}")]
    ResponseTimedOut { peer_id: NodeId, timeout: Duration },
}

/// Inference collaborator errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    #[error("Model not loaded")]
    ModelNotLoaded,

    #[error("Inference unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Generation failed: {reason}")]
    GenerationFailed { reason: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all PULSE errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SwarmError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Timeout error: {0}")]
    Timeout(#[from] TimeoutError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl SwarmError {
    /// Whether the scheduler may retry the operation with backoff.
    ///
    /// Transport failures (except an unknown peer, which will not become known
    /// by waiting) and timeouts are retryable. Resource, protocol, validation
    /// and config errors propagate immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            SwarmError::Transport(TransportError::PeerUnknown { .. }) => false,
            SwarmError::Transport(_) => true,
            SwarmError::Timeout(_) => true,
            SwarmError::Inference(InferenceError::Unavailable { .. }) => true,
            _ => false,
        }
    }
}

/// Result type alias for PULSE operations.
pub type SwarmResult<T> = Result<T, SwarmError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_transport_error_display_unreachable() {
        let err = TransportError::Unreachable {
            peer_id: "pixel-7".to_string(),
            reason: "connection refused".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("pixel-7"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_protocol_error_display_checksum() {
        let err = ProtocolError::ChecksumMismatch {
            expected: 0xdeadbeef,
            got: 0x1,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("0xdeadbeef"));
        assert!(msg.contains("0x00000001"));
    }

    #[test]
    fn test_resource_error_display_memory() {
        let err = ResourceError::InsufficientMemory {
            required_mb: 4096,
            available_mb: 1024,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("4096"));
        assert!(msg.contains("1024"));
    }

    #[test]
    fn test_retryable_classification() {
        let unreachable = SwarmError::from(TransportError::Unreachable {
            peer_id: "a".to_string(),
            reason: "x".to_string(),
        });
        assert!(unreachable.is_retryable());

        let unknown = SwarmError::from(TransportError::PeerUnknown {
            peer_id: "a".to_string(),
        });
        assert!(!unknown.is_retryable());

        let timeout = SwarmError::from(TimeoutError::TaskTimedOut {
            task_id: Uuid::nil(),
            timeout: Duration::from_secs(1),
        });
        assert!(timeout.is_retryable());

        let resource = SwarmError::from(ResourceError::NpuRequired);
        assert!(!resource.is_retryable());

        let protocol = SwarmError::from(ProtocolError::UnsupportedVersion { version: 9 });
        assert!(!protocol.is_retryable());
    }

    #[test]
    fn test_swarm_error_from_variants() {
        let validation = SwarmError::from(ValidationError::RequiredFieldMissing {
            field: "task_type".to_string(),
        });
        assert!(matches!(validation, SwarmError::Validation(_)));

        let config = SwarmError::from(ConfigError::InvalidValue {
            field: "port".to_string(),
            value: "0".to_string(),
            reason: "must be non-zero".to_string(),
        });
        assert!(matches!(config, SwarmError::Config(_)));

        let inference = SwarmError::from(InferenceError::ModelNotLoaded);
        assert!(matches!(inference, SwarmError::Inference(_)));
    }
}
