//! Traits for the external collaborators the core depends on
//!
//! The resource governor (battery, thermal and charge policy) and the
//! on-device inference runtime live outside the core. The scheduler only sees
//! them through these traits and never assumes a call succeeds.

use crate::{Embedding, SwarmResult};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

// ============================================================================
// RESOURCE GOVERNOR
// ============================================================================

/// Answer from the resource governor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GovernorDecision {
    Allowed,
    Denied { reason: String },
}

impl GovernorDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GovernorDecision::Allowed)
    }
}

/// Local policy deciding whether this device may take on work right now.
#[async_trait]
pub trait ResourceGovernor: Send + Sync {
    /// Ask whether a task with the given footprint may run on this device.
    async fn can_execute_task(
        &self,
        memory_mb: u64,
        duration_secs: u64,
        requires_npu: bool,
    ) -> GovernorDecision;
}

// ============================================================================
// INFERENCE RUNTIME
// ============================================================================

/// Sampling parameters for text generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
        }
    }
}

/// Metadata about the loaded model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub parameter_count: u64,
    pub context_length: u32,
    pub memory_mb: u64,
}

/// One timed segment of a transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub confidence: f32,
}

/// Result of a speech-to-text call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub segments: Vec<TranscriptionSegment>,
    pub processing_time_ms: u64,
    pub language: String,
    pub confidence: f32,
}

/// Stream of generated tokens.
pub type TokenStream = BoxStream<'static, SwarmResult<String>>;

/// On-device model runtime.
///
/// Every call may fail with `ModelNotLoaded` or `Unavailable`; callers treat
/// the runtime as a capability provider, not a guarantee.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Load a model from `path`.
    async fn load_model(&self, path: &str, context_length: u32, threads: u32) -> SwarmResult<()>;

    fn is_model_loaded(&self) -> bool;

    async fn unload_model(&self) -> SwarmResult<()>;

    /// Metadata of the loaded model, if any.
    fn model_info(&self) -> Option<ModelInfo>;

    /// Memory the runtime could still commit, in MB.
    fn available_memory_mb(&self) -> u64;

    /// Generate a full completion for `prompt`.
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> SwarmResult<String>;

    /// Generate a completion token by token.
    fn generate_stream(&self, prompt: &str, params: &GenerationParams) -> TokenStream;

    /// Interrupt any in-flight generation.
    fn stop_generation(&self);

    async fn get_embedding(&self, text: &str) -> SwarmResult<Embedding>;

    /// Transcribe mono PCM `samples`; `language` of `None` means auto-detect.
    async fn transcribe(
        &self,
        samples: &[f32],
        language: Option<&str>,
    ) -> SwarmResult<TranscriptionResult>;
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_governor_decision_is_allowed() {
        assert!(GovernorDecision::Allowed.is_allowed());
        assert!(!GovernorDecision::Denied {
            reason: "battery low".to_string()
        }
        .is_allowed());
    }

    #[test]
    fn test_generation_params_default() {
        let params = GenerationParams::default();
        assert_eq!(params.max_tokens, 256);
        assert!(params.temperature > 0.0);
    }
}
