//! Near-term need forecasts
//!
//! Three independent heuristics each propose at most one task type. They are
//! deliberately cheap: the point is to warm the right model or peer before
//! the request arrives, and wrong guesses only cost an accuracy point.

use crate::criticality::FeedbackOutcome;
use chrono::{Timelike, Utc};
use pulse_core::{new_entity_id, EntityId, TaskType, Timestamp};
use serde::{Deserialize, Serialize};

/// Where a prediction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredictionSource {
    TimeOfDay,
    SessionTopic,
    InteractionFrequency,
    Exploration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: EntityId,
    pub task_type: TaskType,
    pub confidence: f64,
    pub source: PredictionSource,
    pub created_at: Timestamp,
}

impl Prediction {
    pub fn new(task_type: TaskType, confidence: f64, source: PredictionSource) -> Self {
        Self {
            id: new_entity_id(),
            task_type,
            confidence: confidence.clamp(0.0, 1.0),
            source,
            created_at: Utc::now(),
        }
    }
}

/// How a retained prediction turned out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionFeedback {
    pub prediction_id: EntityId,
    pub outcome: FeedbackOutcome,
}

/// Signals available when forecasting.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionContext {
    /// Local wall-clock time of the device
    pub now: Timestamp,
    pub session_topic: Option<TaskType>,
    /// Interactions in the last hour
    pub interactions_last_hour: u32,
    /// Task types of recent requests, newest last
    pub recent_task_types: Vec<TaskType>,
}

impl PredictionContext {
    pub fn at(now: Timestamp) -> Self {
        Self {
            now,
            session_topic: None,
            interactions_last_hour: 0,
            recent_task_types: Vec::new(),
        }
    }

    pub fn with_session_topic(mut self, topic: TaskType) -> Self {
        self.session_topic = Some(topic);
        self
    }

    pub fn with_recent(mut self, interactions_last_hour: u32, recent_task_types: Vec<TaskType>) -> Self {
        self.interactions_last_hour = interactions_last_hour;
        self.recent_task_types = recent_task_types;
        self
    }
}

/// Interaction rate band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrequencyClass {
    Low,
    Medium,
    High,
}

impl FrequencyClass {
    pub fn classify(interactions_last_hour: u32) -> Self {
        match interactions_last_hour {
            0..=4 => FrequencyClass::Low,
            5..=19 => FrequencyClass::Medium,
            _ => FrequencyClass::High,
        }
    }

    fn confidence(&self) -> f64 {
        match self {
            FrequencyClass::Low => 0.2,
            FrequencyClass::Medium => 0.5,
            FrequencyClass::High => 0.8,
        }
    }
}

/// Typical demand by hour of day.
pub fn time_of_day_prediction(now: Timestamp) -> Prediction {
    let (task_type, confidence) = match now.hour() {
        5..=11 => (TaskType::Summarization, 0.6),
        12..=17 => (TaskType::TextGeneration, 0.6),
        18..=22 => (TaskType::Transcription, 0.5),
        _ => (TaskType::Embedding, 0.4),
    };
    Prediction::new(task_type, confidence, PredictionSource::TimeOfDay)
}

/// Usual next step after a session about `topic`.
pub fn follow_up(topic: TaskType) -> TaskType {
    match topic {
        TaskType::Transcription => TaskType::Summarization,
        TaskType::TextGeneration => TaskType::Translation,
        TaskType::Summarization | TaskType::Translation | TaskType::ImageAnalysis => TaskType::TextGeneration,
        TaskType::Embedding => TaskType::TextGeneration,
    }
}

pub fn session_topic_prediction(context: &PredictionContext) -> Option<Prediction> {
    context
        .session_topic
        .map(|topic| Prediction::new(follow_up(topic), 0.7, PredictionSource::SessionTopic))
}

/// Most frequent recent task type, weighted by how busy the user is. Ties
/// go to the most recent of the tied types.
pub fn frequency_prediction(context: &PredictionContext) -> Option<Prediction> {
    let mut best: Option<(TaskType, usize, usize)> = None;
    for (position, task_type) in context.recent_task_types.iter().enumerate() {
        let count = context.recent_task_types.iter().filter(|t| *t == task_type).count();
        let replace = match best {
            None => true,
            Some((_, best_count, best_position)) => {
                count > best_count || (count == best_count && position > best_position)
            }
        };
        if replace {
            best = Some((*task_type, count, position));
        }
    }
    let (task_type, _, _) = best?;
    let class = FrequencyClass::classify(context.interactions_last_hour);
    Some(Prediction::new(
        task_type,
        class.confidence(),
        PredictionSource::InteractionFrequency,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_of_day_bands() {
        let at = |h| Utc.with_ymd_and_hms(2026, 3, 1, h, 30, 0).unwrap();
        assert_eq!(time_of_day_prediction(at(8)).task_type, TaskType::Summarization);
        assert_eq!(time_of_day_prediction(at(14)).task_type, TaskType::TextGeneration);
        assert_eq!(time_of_day_prediction(at(20)).task_type, TaskType::Transcription);
        assert_eq!(time_of_day_prediction(at(2)).task_type, TaskType::Embedding);
    }

    #[test]
    fn test_session_follow_up() {
        let context = PredictionContext::at(Utc::now()).with_session_topic(TaskType::Transcription);
        let prediction = session_topic_prediction(&context).unwrap();
        assert_eq!(prediction.task_type, TaskType::Summarization);
        assert_eq!(prediction.source, PredictionSource::SessionTopic);
        assert!(session_topic_prediction(&PredictionContext::at(Utc::now())).is_none());
    }

    #[test]
    fn test_frequency_picks_most_common() {
        let context = PredictionContext::at(Utc::now()).with_recent(
            25,
            vec![
                TaskType::Translation,
                TaskType::TextGeneration,
                TaskType::Translation,
                TaskType::Embedding,
            ],
        );
        let prediction = frequency_prediction(&context).unwrap();
        assert_eq!(prediction.task_type, TaskType::Translation);
        assert_eq!(prediction.confidence, 0.8);
    }

    #[test]
    fn test_frequency_tie_prefers_recent() {
        let context = PredictionContext::at(Utc::now())
            .with_recent(2, vec![TaskType::Translation, TaskType::Embedding]);
        let prediction = frequency_prediction(&context).unwrap();
        assert_eq!(prediction.task_type, TaskType::Embedding);
        assert_eq!(prediction.confidence, 0.2);
    }

    #[test]
    fn test_frequency_classes() {
        assert_eq!(FrequencyClass::classify(0), FrequencyClass::Low);
        assert_eq!(FrequencyClass::classify(5), FrequencyClass::Medium);
        assert_eq!(FrequencyClass::classify(20), FrequencyClass::High);
    }
}
