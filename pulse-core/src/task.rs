//! Task types and the task status state machine

use crate::{ModelType, NodeId, SwarmResult, TaskId, Timestamp, ValidationError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of work a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskType {
    TextGeneration,
    Summarization,
    Translation,
    Embedding,
    Transcription,
    ImageAnalysis,
}

impl TaskType {
    /// All task types, in declaration order.
    pub const ALL: [TaskType; 6] = [
        TaskType::TextGeneration,
        TaskType::Summarization,
        TaskType::Translation,
        TaskType::Embedding,
        TaskType::Transcription,
        TaskType::ImageAnalysis,
    ];

    /// Model family needed to execute this task.
    pub fn required_model(&self) -> ModelType {
        match self {
            TaskType::TextGeneration | TaskType::Summarization | TaskType::Translation => {
                ModelType::Llm
            }
            TaskType::Embedding => ModelType::Embedding,
            TaskType::Transcription => ModelType::Speech,
            TaskType::ImageAnalysis => ModelType::Vision,
        }
    }

    /// Whether answers to this task type can be reused from the semantic cache.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            TaskType::TextGeneration | TaskType::Summarization | TaskType::Translation
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::TextGeneration => "text_generation",
            TaskType::Summarization => "summarization",
            TaskType::Translation => "translation",
            TaskType::Embedding => "embedding",
            TaskType::Transcription => "transcription",
            TaskType::ImageAnalysis => "image_analysis",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estimated complexity class of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskComplexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Heavy,
}

/// Priority shared by tasks and wire messages.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Hard and soft resource requirements of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub min_memory_mb: u64,
    pub requires_npu: bool,
    /// Estimated execution time on a single capable node
    pub estimated_duration: Duration,
    pub max_retries: u32,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            min_memory_mb: 512,
            requires_npu: false,
            estimated_duration: Duration::from_secs(5),
            max_retries: 2,
        }
    }
}

/// A request to run a task somewhere in the swarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmitRequest {
    pub task_type: TaskType,
    pub input: serde_json::Value,
    pub priority: Priority,
    pub requirements: ResourceRequirements,
    pub complexity: TaskComplexity,
    pub deadline: Option<Timestamp>,
    pub max_parallel_nodes: u32,
    pub timeout: Duration,
}

impl TaskSubmitRequest {
    /// Create a request with default requirements.
    pub fn new(task_type: TaskType, input: serde_json::Value) -> Self {
        Self {
            task_type,
            input,
            priority: Priority::Normal,
            requirements: ResourceRequirements::default(),
            complexity: TaskComplexity::Simple,
            deadline: None,
            max_parallel_nodes: 1,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requirements(mut self, requirements: ResourceRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_complexity(mut self, complexity: TaskComplexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_deadline(mut self, deadline: Timestamp) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_parallel_nodes(mut self, n: u32) -> Self {
        self.max_parallel_nodes = n;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Text used to look the task up in the semantic cache, if any.
    pub fn prompt(&self) -> Option<&str> {
        match &self.input {
            serde_json::Value::String(s) => Some(s.as_str()),
            serde_json::Value::Object(map) => map.get("prompt").and_then(|v| v.as_str()),
            _ => None,
        }
    }

    /// Check structural validity of the request.
    pub fn validate(&self) -> SwarmResult<()> {
        if self.timeout.is_zero() {
            return Err(ValidationError::InvalidValue {
                field: "timeout".to_string(),
                reason: "timeout must be positive".to_string(),
            }
            .into());
        }
        if self.max_parallel_nodes == 0 {
            return Err(ValidationError::InvalidValue {
                field: "max_parallel_nodes".to_string(),
                reason: "at least one node is required".to_string(),
            }
            .into());
        }
        if self.input.is_null() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "input".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Queued,
    Assigned,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl TaskStatus {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Rejected
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }
        matches!(
            (*self, next),
            (Pending, Queued)
                | (Pending, Assigned)
                | (Pending, Rejected)
                | (Queued, Assigned)
                | (Assigned, Running)
                | (Running, Completed)
                | (Running, Retrying)
                | (Running, Failed)
                | (Retrying, Running)
                | (Retrying, Failed)
        )
    }
}

/// Live record of a submitted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub request: TaskSubmitRequest,
    pub status: TaskStatus,
    pub assigned_nodes: Vec<NodeId>,
    /// Progress in [0, 1]
    pub progress: f64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

impl TaskInfo {
    /// Create a pending task record.
    pub fn new(task_id: TaskId, request: TaskSubmitRequest) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            request,
            status: TaskStatus::Pending,
            assigned_nodes: Vec::new(),
            progress: 0.0,
            result: None,
            error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to `next`, refusing transitions the state machine does not allow.
    pub fn transition(&mut self, next: TaskStatus) -> SwarmResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ValidationError::IllegalTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", next),
            }
            .into());
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.finished_at = Some(now);
            if next == TaskStatus::Completed {
                self.progress = 1.0;
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_request_validate_rejects_zero_timeout() {
        let req = TaskSubmitRequest::new(TaskType::TextGeneration, json!("hi"))
            .with_timeout(Duration::ZERO);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_request_validate_rejects_zero_parallelism() {
        let req = TaskSubmitRequest::new(TaskType::TextGeneration, json!("hi"))
            .with_max_parallel_nodes(0);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_prompt_extraction() {
        let plain = TaskSubmitRequest::new(TaskType::TextGeneration, json!("what is rust"));
        assert_eq!(plain.prompt(), Some("what is rust"));

        let object = TaskSubmitRequest::new(
            TaskType::Summarization,
            json!({"prompt": "summarize this", "max_tokens": 64}),
        );
        assert_eq!(object.prompt(), Some("summarize this"));

        let none = TaskSubmitRequest::new(TaskType::Embedding, json!([1, 2, 3]));
        assert_eq!(none.prompt(), None);
    }

    #[test]
    fn test_task_lifecycle_happy_path() {
        let mut task = TaskInfo::new(
            Uuid::now_v7(),
            TaskSubmitRequest::new(TaskType::TextGeneration, json!("hi")),
        );
        task.transition(TaskStatus::Assigned).unwrap();
        task.transition(TaskStatus::Running).unwrap();
        task.transition(TaskStatus::Retrying).unwrap();
        task.transition(TaskStatus::Running).unwrap();
        task.transition(TaskStatus::Completed).unwrap();
        assert_eq!(task.progress, 1.0);
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut task = TaskInfo::new(
            Uuid::now_v7(),
            TaskSubmitRequest::new(TaskType::TextGeneration, json!("hi")),
        );
        task.transition(TaskStatus::Cancelled).unwrap();
        let err = task.transition(TaskStatus::Running).unwrap_err();
        assert!(matches!(
            err,
            crate::SwarmError::Validation(ValidationError::IllegalTransition { .. })
        ));
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_pending_cannot_jump_to_completed() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Cancelled));
    }
}
