//! PULSE Test Utilities
//!
//! Centralized test infrastructure for the PULSE workspace:
//! - Proptest generators for every wire payload and core type
//! - Mock resource governor and inference runtime
//! - Fixtures for common swarm scenarios
//! - Assertions for PULSE error classes

pub use pulse_core::{
    CacheConfig, ConnectionState, Embedding, GenerationParams, GovernorDecision,
    InferenceEngine, InferenceError, KnowledgeItem, MessagePayload, MessageType, ModelInfo,
    ModelType, NodeAnnouncement, NodeCapabilities, NodeId, PeerNode, Priority, PulseConfig,
    ResourceGovernor, ResourceRequirements, SemanticCacheEntry, SwarmError, SwarmMessage,
    SwarmResult, TaskComplexity, TaskOutcome, TaskStatus, TaskSubmitRequest, TaskType,
    Timestamp, TokenStream, TranscriptionResult, TranscriptionSegment,
};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

// ============================================================================
// MOCK COLLABORATORS
// ============================================================================

/// Resource governor with a settable answer.
#[derive(Debug)]
pub struct MockGovernor {
    decision: Mutex<GovernorDecision>,
    calls: AtomicUsize,
}

impl MockGovernor {
    pub fn allow_all() -> Self {
        Self {
            decision: Mutex::new(GovernorDecision::Allowed),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn deny_all(reason: impl Into<String>) -> Self {
        Self {
            decision: Mutex::new(GovernorDecision::Denied {
                reason: reason.into(),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_decision(&self, decision: GovernorDecision) {
        *self.decision.lock().unwrap_or_else(|p| p.into_inner()) = decision;
    }

    /// Number of times the governor was consulted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockGovernor {
    fn default() -> Self {
        Self::allow_all()
    }
}

#[async_trait]
impl ResourceGovernor for MockGovernor {
    async fn can_execute_task(&self, _memory_mb: u64, _duration_secs: u64, _requires_npu: bool) -> GovernorDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.decision.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Deterministic inference runtime.
///
/// Generation echoes the prompt, embeddings are derived from the text bytes
/// and the next `fail_next` calls fail with `Unavailable`.
#[derive(Debug)]
pub struct MockInference {
    loaded: AtomicBool,
    dimensions: usize,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
    stopped: AtomicBool,
}

impl MockInference {
    pub fn new(dimensions: usize) -> Self {
        Self {
            loaded: AtomicBool::new(true),
            dimensions: dimensions.max(1),
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Runtime with no model loaded.
    pub fn unloaded() -> Self {
        let mock = Self::new(8);
        mock.loaded.store(false, Ordering::SeqCst);
        mock
    }

    /// Make the next `n` inference calls fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn enter(&self) -> SwarmResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(InferenceError::ModelNotLoaded.into());
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(InferenceError::Unavailable {
                reason: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Byte-folded, L2-normalized embedding of `text`.
    pub fn embed_text(&self, text: &str) -> Embedding {
        let mut data = vec![0.0f32; self.dimensions];
        for (i, byte) in text.bytes().enumerate() {
            data[i % self.dimensions] += (byte as f32) / 255.0;
        }
        let norm: f32 = data.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut data {
                *x /= norm;
            }
        }
        data
    }
}

impl Default for MockInference {
    fn default() -> Self {
        Self::new(16)
    }
}

#[async_trait]
impl InferenceEngine for MockInference {
    async fn load_model(&self, _path: &str, _context_length: u32, _threads: u32) -> SwarmResult<()> {
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_model_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn unload_model(&self) -> SwarmResult<()> {
        self.loaded.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn model_info(&self) -> Option<ModelInfo> {
        self.is_model_loaded().then(|| ModelInfo {
            name: "mock-1b".to_string(),
            parameter_count: 1_000_000_000,
            context_length: 2048,
            memory_mb: 700,
        })
    }

    fn available_memory_mb(&self) -> u64 {
        2048
    }

    async fn generate(&self, prompt: &str, _params: &GenerationParams) -> SwarmResult<String> {
        self.enter()?;
        Ok(format!("Echo: {prompt}"))
    }

    fn generate_stream(&self, prompt: &str, _params: &GenerationParams) -> TokenStream {
        if let Err(e) = self.enter() {
            return stream::once(async move { Err(e) }).boxed();
        }
        let tokens: Vec<SwarmResult<String>> = prompt
            .split_whitespace()
            .map(|t| Ok(format!("{t} ")))
            .collect();
        stream::iter(tokens).boxed()
    }

    fn stop_generation(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn get_embedding(&self, text: &str) -> SwarmResult<Embedding> {
        self.enter()?;
        Ok(self.embed_text(text))
    }

    async fn transcribe(&self, samples: &[f32], language: Option<&str>) -> SwarmResult<TranscriptionResult> {
        self.enter()?;
        // 16 kHz mono
        let end_ms = (samples.len() as u64 * 1000) / 16_000;
        Ok(TranscriptionResult {
            text: "mock transcript".to_string(),
            segments: vec![TranscriptionSegment {
                text: "mock transcript".to_string(),
                start_ms: 0,
                end_ms,
                confidence: 0.9,
            }],
            processing_time_ms: 1,
            language: language.unwrap_or("en").to_string(),
            confidence: 0.9,
        })
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating PULSE types.

    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use uuid::Uuid;

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Generate a node id.
    pub fn arb_node_id() -> impl Strategy<Value = NodeId> {
        "[a-z]{2,8}-[0-9]{1,3}".prop_map(|s| s)
    }

    /// Generate a Timestamp within 2020-2030, with sub-second precision.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64, 0u32..1_000_000_000).prop_map(|(secs, nanos)| {
            chrono::DateTime::from_timestamp(secs, nanos).unwrap_or_else(Utc::now)
        })
    }

    pub fn arb_socket_addr() -> impl Strategy<Value = SocketAddr> {
        (any::<[u8; 4]>(), 1u16..u16::MAX).prop_map(|(ip, port)| SocketAddr::from((ip, port)))
    }

    /// Embedding whose components are exact binary fractions.
    pub fn arb_embedding() -> impl Strategy<Value = Embedding> {
        prop::collection::vec((-64i32..64).prop_map(|i| i as f32 / 64.0), 1..16)
    }

    /// Generate a unit-interval score.
    pub fn arb_unit() -> impl Strategy<Value = f64> {
        0.0f64..=1.0
    }

    // === Enum Generators ===

    pub fn arb_model_type() -> impl Strategy<Value = ModelType> {
        prop_oneof![
            Just(ModelType::Llm),
            Just(ModelType::Embedding),
            Just(ModelType::Speech),
            Just(ModelType::Vision),
        ]
    }

    pub fn arb_task_type() -> impl Strategy<Value = TaskType> {
        proptest::sample::select(TaskType::ALL.to_vec())
    }

    pub fn arb_priority() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Normal),
            Just(Priority::High),
            Just(Priority::Urgent),
        ]
    }

    pub fn arb_complexity() -> impl Strategy<Value = TaskComplexity> {
        prop_oneof![
            Just(TaskComplexity::Trivial),
            Just(TaskComplexity::Simple),
            Just(TaskComplexity::Moderate),
            Just(TaskComplexity::Complex),
            Just(TaskComplexity::Heavy),
        ]
    }

    pub fn arb_task_status() -> impl Strategy<Value = TaskStatus> {
        prop_oneof![
            Just(TaskStatus::Pending),
            Just(TaskStatus::Queued),
            Just(TaskStatus::Assigned),
            Just(TaskStatus::Running),
            Just(TaskStatus::Retrying),
            Just(TaskStatus::Completed),
            Just(TaskStatus::Failed),
            Just(TaskStatus::Cancelled),
            Just(TaskStatus::Rejected),
        ]
    }

    // === Struct Generators ===

    pub fn arb_capabilities() -> impl Strategy<Value = NodeCapabilities> {
        (
            any::<bool>(),
            512u64..16_384,
            0u64..16_384,
            prop::collection::vec(arb_model_type(), 0..4),
            1u32..8,
            1u32..16,
            any::<bool>(),
        )
            .prop_map(
                |(has_npu, total, available, supported_models, max_tasks, cores, has_gpu)| {
                    NodeCapabilities {
                        has_npu,
                        total_memory_mb: total,
                        available_memory_mb: available.min(total),
                        supported_models,
                        max_concurrent_tasks: max_tasks,
                        cpu_cores: cores,
                        has_gpu,
                    }
                },
            )
    }

    pub fn arb_peer() -> impl Strategy<Value = PeerNode> {
        (arb_node_id(), arb_socket_addr(), arb_capabilities())
            .prop_map(|(id, addr, caps)| PeerNode::new(id, addr, caps))
    }

    /// Small JSON values (no floats, so equality survives a round-trip).
    pub fn arb_json() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[a-zA-Z0-9 ]{0,40}".prop_map(serde_json::Value::from),
            ("[a-z]{1,8}", "[a-zA-Z0-9 ]{0,20}")
                .prop_map(|(k, v)| serde_json::json!({ k: v })),
        ]
    }

    pub fn arb_requirements() -> impl Strategy<Value = ResourceRequirements> {
        (0u64..8192, any::<bool>(), 1u64..600_000, 0u32..5).prop_map(
            |(min_memory_mb, requires_npu, millis, max_retries)| ResourceRequirements {
                min_memory_mb,
                requires_npu,
                estimated_duration: Duration::from_millis(millis),
                max_retries,
            },
        )
    }

    pub fn arb_task_request() -> impl Strategy<Value = TaskSubmitRequest> {
        (
            arb_task_type(),
            arb_json(),
            arb_priority(),
            arb_requirements(),
            arb_complexity(),
            prop::option::of(arb_timestamp()),
            1u32..4,
            1u64..120_000,
        )
            .prop_map(
                |(task_type, input, priority, requirements, complexity, deadline, nodes, millis)| {
                    TaskSubmitRequest {
                        task_type,
                        input,
                        priority,
                        requirements,
                        complexity,
                        deadline,
                        max_parallel_nodes: nodes,
                        timeout: Duration::from_millis(millis),
                    }
                },
            )
    }

    pub fn arb_cache_entry() -> impl Strategy<Value = SemanticCacheEntry> {
        (
            arb_uuid(),
            "[a-zA-Z ?]{1,60}",
            prop::option::of(arb_embedding()),
            "[a-zA-Z .]{1,120}",
            arb_unit(),
            arb_node_id(),
            arb_timestamp(),
            arb_timestamp(),
            0u64..1000,
        )
            .prop_map(
                |(id, query, embedding, answer, quality, source_node, created_at, last_accessed, hit_count)| {
                    SemanticCacheEntry {
                        id,
                        query,
                        embedding,
                        answer,
                        quality,
                        source_node,
                        created_at,
                        last_accessed,
                        hit_count,
                    }
                },
            )
    }

    pub fn arb_knowledge_item() -> impl Strategy<Value = KnowledgeItem> {
        (
            arb_uuid(),
            "[a-z]{1,12}",
            "[a-zA-Z .]{0,80}",
            arb_unit(),
            arb_node_id(),
            arb_timestamp(),
        )
            .prop_map(|(id, topic, content, confidence, source_node, created_at)| KnowledgeItem {
                id,
                topic,
                content,
                confidence,
                source_node,
                created_at,
            })
    }

    pub fn arb_task_outcome() -> impl Strategy<Value = TaskOutcome> {
        (
            arb_uuid(),
            any::<bool>(),
            prop::option::of(arb_json()),
            prop::option::of("[a-z ]{1,30}"),
            0u64..60_000,
            arb_unit(),
        )
            .prop_map(|(task_id, success, result, error, processing_time_ms, quality)| TaskOutcome {
                task_id,
                success,
                result,
                error,
                processing_time_ms,
                quality,
            })
    }

    /// One payload of every variant.
    pub fn arb_payload() -> impl Strategy<Value = MessagePayload> {
        prop_oneof![
            (arb_node_id(), "[a-zA-Z ]{1,20}", arb_socket_addr(), arb_capabilities()).prop_map(
                |(node_id, display_name, address, capabilities)| {
                    MessagePayload::NodeAnnounce(NodeAnnouncement {
                        node_id,
                        display_name,
                        address,
                        capabilities,
                    })
                }
            ),
            (arb_unit(), any::<u64>(), 0u32..16).prop_map(|(load, available_memory_mb, active_tasks)| {
                MessagePayload::NodeHeartbeat {
                    load,
                    available_memory_mb,
                    active_tasks,
                }
            }),
            prop::option::of("[a-z ]{1,20}").prop_map(|reason| MessagePayload::NodeLeave { reason }),
            (arb_uuid(), arb_task_request())
                .prop_map(|(task_id, request)| MessagePayload::TaskRequest { task_id, request }),
            arb_task_outcome().prop_map(MessagePayload::TaskResponse),
            (arb_uuid(), arb_task_status(), arb_unit()).prop_map(|(task_id, status, progress)| {
                MessagePayload::TaskStatus {
                    task_id,
                    status,
                    progress,
                }
            }),
            (arb_uuid(), prop::option::of("[a-z ]{1,20}"))
                .prop_map(|(task_id, reason)| MessagePayload::TaskCancel { task_id, reason }),
            prop::collection::vec(arb_cache_entry(), 0..3)
                .prop_map(|entries| MessagePayload::CacheShare { entries }),
            (arb_uuid(), "[a-zA-Z ?]{1,40}", prop::option::of(arb_embedding())).prop_map(
                |(query_id, query, embedding)| MessagePayload::CacheQuery {
                    query_id,
                    query,
                    embedding,
                }
            ),
            (arb_uuid(), prop::option::of(arb_cache_entry()), arb_unit()).prop_map(
                |(query_id, entry, similarity)| MessagePayload::CacheResponse {
                    query_id,
                    entry,
                    similarity,
                }
            ),
            prop::collection::vec(arb_knowledge_item(), 0..3)
                .prop_map(|items| MessagePayload::KnowledgeSync { items }),
            arb_capabilities().prop_map(|capabilities| MessagePayload::CapabilityUpdate { capabilities }),
            ("[a-z]{1,10}", arb_json()).prop_map(|(topic, data)| MessagePayload::Gossip { topic, data }),
        ]
    }

    /// A well-formed message; the declared type always matches the payload.
    pub fn arb_swarm_message() -> impl Strategy<Value = SwarmMessage> {
        (
            arb_uuid(),
            arb_node_id(),
            prop::option::of(arb_node_id()),
            arb_timestamp(),
            0u8..8,
            arb_priority(),
            arb_payload(),
        )
            .prop_map(|(id, sender_id, recipient_id, timestamp, ttl, priority, payload)| SwarmMessage {
                id,
                message_type: payload.message_type(),
                sender_id,
                recipient_id,
                timestamp,
                ttl,
                priority,
                payload,
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common swarm scenarios.

    use super::*;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::time::Duration;

    /// Loopback address with the given port.
    pub fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Mid-range phone: no NPU, 2 GB free, LLM + embeddings.
    pub fn phone_capabilities() -> NodeCapabilities {
        NodeCapabilities::default()
    }

    /// Flagship device with an NPU and plenty of memory.
    pub fn npu_capabilities() -> NodeCapabilities {
        NodeCapabilities {
            has_npu: true,
            total_memory_mb: 12_288,
            available_memory_mb: 8_192,
            supported_models: vec![ModelType::Llm, ModelType::Embedding, ModelType::Speech],
            max_concurrent_tasks: 4,
            cpu_cores: 8,
            has_gpu: true,
        }
    }

    /// Low-end device that cannot run much.
    pub fn low_memory_capabilities() -> NodeCapabilities {
        NodeCapabilities {
            has_npu: false,
            total_memory_mb: 1024,
            available_memory_mb: 256,
            supported_models: vec![ModelType::Embedding],
            max_concurrent_tasks: 1,
            cpu_cores: 4,
            has_gpu: false,
        }
    }

    pub fn peer(id: &str, port: u16, capabilities: NodeCapabilities) -> PeerNode {
        PeerNode::new(id, addr(port), capabilities)
    }

    pub fn text_request(prompt: &str) -> TaskSubmitRequest {
        TaskSubmitRequest::new(TaskType::TextGeneration, json!(prompt))
    }

    pub fn npu_request(prompt: &str) -> TaskSubmitRequest {
        text_request(prompt).with_requirements(ResourceRequirements {
            requires_npu: true,
            ..Default::default()
        })
    }

    pub fn heavy_request_with_deadline(prompt: &str, seconds: i64) -> TaskSubmitRequest {
        text_request(prompt)
            .with_complexity(TaskComplexity::Heavy)
            .with_deadline(chrono::Utc::now() + chrono::Duration::seconds(seconds))
            .with_timeout(Duration::from_secs(120))
    }

    /// Configuration with short intervals and a fixed RNG seed.
    pub fn test_config(node_id: &str) -> PulseConfig {
        let mut config = PulseConfig::default();
        config.transport.node_id = node_id.to_string();
        config.transport.display_name = node_id.to_string();
        config.predictor.rng_seed = Some(7);
        config.scheduler.initial_backoff = Duration::from_millis(1);
        config.scheduler.max_backoff = Duration::from_millis(4);
        config
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for PULSE error classes.

    use super::*;

    pub fn assert_validation_error<T: std::fmt::Debug>(result: &SwarmResult<T>) {
        assert!(
            matches!(result, Err(SwarmError::Validation(_))),
            "Expected validation error, got {:?}",
            result
        );
    }

    pub fn assert_resource_error<T: std::fmt::Debug>(result: &SwarmResult<T>) {
        assert!(
            matches!(result, Err(SwarmError::Resource(_))),
            "Expected resource error, got {:?}",
            result
        );
    }

    pub fn assert_transport_error<T: std::fmt::Debug>(result: &SwarmResult<T>) {
        assert!(
            matches!(result, Err(SwarmError::Transport(_))),
            "Expected transport error, got {:?}",
            result
        );
    }

    pub fn assert_protocol_error<T: std::fmt::Debug>(result: &SwarmResult<T>) {
        assert!(
            matches!(result, Err(SwarmError::Protocol(_))),
            "Expected protocol error, got {:?}",
            result
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
