//! Immune memory: past problems and the solutions that worked

use chrono::Utc;
use pulse_core::{
    age_hours, cosine_similarity, jaccard_similarity, new_entity_id, tokenize, Embedding, EntityId, TaskComplexity,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Hours over which potency falls by a factor of e.
pub const POTENCY_AGE_SCALE_HOURS: f64 = 168.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    /// Exact-match key, e.g. "model_load_failure"
    pub problem_type: String,
    pub description: String,
    pub embedding: Option<Embedding>,
    pub keywords: BTreeSet<String>,
    pub complexity: TaskComplexity,
    pub category: String,
}

impl Problem {
    /// Keywords default to the description's tokens.
    pub fn new(problem_type: impl Into<String>, description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            problem_type: problem_type.into(),
            keywords: tokenize(&description),
            description,
            embedding: None,
            complexity: TaskComplexity::Moderate,
            category: "general".to_string(),
        }
    }

    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.keywords = keywords.into_iter().map(|k| k.as_ref().to_lowercase()).collect();
        self
    }

    pub fn with_complexity(mut self, complexity: TaskComplexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub approach: String,
    pub steps: Vec<String>,
    pub resources: Vec<String>,
    pub estimated_time: Duration,
    pub success_indicators: Vec<String>,
}

impl Solution {
    pub fn new(approach: impl Into<String>) -> Self {
        Self {
            approach: approach.into(),
            steps: Vec::new(),
            resources: Vec::new(),
            estimated_time: Duration::ZERO,
            success_indicators: Vec::new(),
        }
    }

    pub fn with_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_estimated_time(mut self, estimated_time: Duration) -> Self {
        self.estimated_time = estimated_time;
        self
    }
}

/// Blend of keyword overlap (40%) and embedding cosine (60%). Without
/// comparable embeddings the cosine term is a neutral 0.5.
pub fn problem_similarity(a: &Problem, b: &Problem) -> f64 {
    let keywords = jaccard_similarity(&a.keywords, &b.keywords);
    let semantic = match (&a.embedding, &b.embedding) {
        (Some(x), Some(y)) => cosine_similarity(x, y).map(|s| s.max(0.0)).unwrap_or(0.5),
        _ => 0.5,
    };
    0.4 * keywords + 0.6 * semantic
}

/// A stored problem→solution pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaccineEntry {
    pub id: EntityId,
    pub problem: Problem,
    pub solution: Solution,
    /// Effectiveness in [0, 1]
    pub effectiveness: f64,
    pub created_at: Timestamp,
    pub last_used: Option<Timestamp>,
    pub use_count: u64,
    pub success_rate: f64,
    /// Multiplier in (0, 1], eroded while idle and restored by use
    pub decay_factor: f64,
}

impl VaccineEntry {
    pub fn new(problem: Problem, solution: Solution, effectiveness: f64) -> Self {
        Self {
            id: new_entity_id(),
            problem,
            solution,
            effectiveness: effectiveness.clamp(0.0, 1.0),
            created_at: Utc::now(),
            last_used: None,
            use_count: 0,
            success_rate: 0.0,
            decay_factor: 1.0,
        }
    }

    /// `effectiveness × exp(-ageHours/168) × (1 + ln(useCount+1)/5) × decayFactor`
    pub fn potency_at(&self, now: Timestamp) -> f64 {
        let age = age_hours(self.created_at, now);
        let freshness = (-age / POTENCY_AGE_SCALE_HOURS).exp();
        let usage = 1.0 + ((self.use_count as f64) + 1.0).ln() / 5.0;
        self.effectiveness * freshness * usage * self.decay_factor
    }

    pub fn potency(&self) -> f64 {
        self.potency_at(Utc::now())
    }

    /// Never used and older than `max_age`.
    pub fn is_expired_at(&self, now: Timestamp, max_age: Duration) -> bool {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        self.use_count == 0 && now.signed_duration_since(self.created_at).num_milliseconds() > max_age_ms
    }

    /// Most recent activity: last use, or creation if never used.
    pub fn last_activity(&self) -> Timestamp {
        self.last_used.unwrap_or(self.created_at)
    }

    pub(crate) fn record_usage(&mut self, success: bool, now: Timestamp) {
        self.use_count = self.use_count.saturating_add(1);
        self.last_used = Some(now);
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate += (outcome - self.success_rate) / self.use_count as f64;
        self.decay_factor = (self.decay_factor + 0.1).min(1.0);
    }
}
