//! Configuration types

use crate::{ConfigError, SwarmError, SwarmResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// DNS-SD service type advertised on the local network.
pub const SERVICE_TYPE: &str = "_pulsenetwork._tcp";

/// Default TCP port of the peer protocol.
pub const DEFAULT_PORT: u16 = 37373;

/// Maximum frame payload, 16 MiB.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

// ============================================================================
// SECTIONS
// ============================================================================

/// Peer registry and transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub node_id: String,
    pub display_name: String,
    pub service_type: String,
    pub port: u16,
    /// Hop budget for new messages
    pub default_ttl: u8,
    /// Peers silent for longer than this are evicted
    pub max_silence: Duration,
    pub connect_timeout: Duration,
    /// Number of message ids remembered for relay deduplication
    pub seen_capacity: usize,
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            node_id: "pulse-node".to_string(),
            display_name: "PULSE node".to_string(),
            service_type: SERVICE_TYPE.to_string(),
            port: DEFAULT_PORT,
            default_ttl: crate::DEFAULT_TTL,
            max_silence: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(5),
            seen_capacity: 4096,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

/// Semantic gossip cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub similarity_threshold: f64,
    /// Hard cap on local + network entries combined
    pub max_entries: usize,
    /// Entries below this quality are never gossiped
    pub share_floor: f64,
    /// Entries sent per gossip round
    pub share_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            max_entries: 1000,
            share_floor: 0.5,
            share_limit: 20,
        }
    }
}

/// Hebbian trust model constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationConfig {
    pub ltp_rate: f64,
    pub ltd_rate: f64,
    pub quality_weight: f64,
    pub response_time_weight: f64,
    pub fast_response_ms: u64,
    pub slow_response_ms: u64,
    pub initial_strength: f64,
    pub decay_rate: f64,
    pub decay_period: Duration,
    pub mirror_learning_rate: f64,
    pub expertise_learning_rate: f64,
    pub min_strength: f64,
    pub max_strength: f64,
    /// Violations tolerated before each further one costs strength
    pub violation_allowance: u32,
}

impl Default for RelationConfig {
    fn default() -> Self {
        Self {
            ltp_rate: 0.1,
            ltd_rate: 0.05,
            quality_weight: 0.3,
            response_time_weight: 0.2,
            fast_response_ms: 100,
            slow_response_ms: 5000,
            initial_strength: 0.1,
            decay_rate: 0.01,
            decay_period: Duration::from_secs(24 * 3600),
            mirror_learning_rate: 0.02,
            expertise_learning_rate: 0.1,
            min_strength: 0.01,
            max_strength: 1.0,
            violation_allowance: 2,
        }
    }
}

/// Exploration/exploitation controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalityConfig {
    pub initial_exploration: f64,
    pub adjustment_step: f64,
    pub min_exploration: f64,
    pub max_exploration: f64,
    pub low_accuracy_threshold: f64,
    pub high_accuracy_threshold: f64,
    pub accuracy_window: usize,
    pub history_limit: usize,
    /// Partial hits scoring above this count as half a hit
    pub partial_hit_threshold: f64,
}

impl Default for CriticalityConfig {
    fn default() -> Self {
        Self {
            initial_exploration: 0.2,
            adjustment_step: 0.05,
            min_exploration: 0.05,
            max_exploration: 0.5,
            low_accuracy_threshold: 0.5,
            high_accuracy_threshold: 0.9,
            accuracy_window: 100,
            history_limit: 50,
            partial_hit_threshold: 0.7,
        }
    }
}

/// Predictor and schedule decision settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorConfig {
    /// Above this average latency work stays local
    pub latency_ceiling_ms: f64,
    /// Above this average load work is queued
    pub busy_load_threshold: f64,
    /// Deadlines closer than this are imminent
    pub imminent_deadline: Duration,
    /// Time allowance multiplier for remote execution and heavy queueing
    pub overhead_factor: f64,
    /// Upper bound of the uniform jitter added while exploring
    pub exploration_jitter: f64,
    /// Smoothing factor of the per-node load/availability averages
    pub history_smoothing: f64,
    pub max_pending_predictions: usize,
    /// Fixed RNG seed; `None` seeds from the OS
    pub rng_seed: Option<u64>,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            latency_ceiling_ms: 500.0,
            busy_load_threshold: 0.9,
            imminent_deadline: Duration::from_secs(60),
            overhead_factor: 2.0,
            exploration_jitter: 0.1,
            history_smoothing: 0.3,
            max_pending_predictions: 256,
            rng_seed: None,
        }
    }
}

/// Competence and immune memory settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionConfig {
    pub growth_rate: f64,
    pub base_experience: f64,
    pub max_vaccines: usize,
    pub max_vaccine_age: Duration,
    pub vaccine_decay_rate: f64,
    pub similarity_threshold: f64,
    /// Capacity of the evolution event broadcast channel
    pub event_capacity: usize,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            growth_rate: 0.01,
            base_experience: 100.0,
            max_vaccines: 500,
            max_vaccine_age: Duration::from_secs(30 * 24 * 3600),
            vaccine_decay_rate: 0.05,
            similarity_threshold: 0.85,
            event_capacity: 64,
        }
    }
}

/// Backoff shape between task attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(ConfigError::InvalidValue {
                field: "backoff".to_string(),
                value: other.to_string(),
                reason: "expected fixed or exponential".to_string(),
            }),
        }
    }
}

/// Task scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub backoff: BackoffKind,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Terminal tasks are kept this long before purge
    pub terminal_grace: Duration,
    pub max_queue_len: usize,
    /// Quality recorded for answers produced by this device
    pub local_answer_quality: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffKind::Exponential,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            terminal_grace: Duration::from_secs(600),
            max_queue_len: 256,
            local_answer_quality: 0.8,
        }
    }
}

/// Cadence of the periodic maintenance loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    pub decay_interval: Duration,
    pub vaccine_sweep_interval: Duration,
    pub silence_check_interval: Duration,
    pub gossip_interval: Duration,
    pub purge_interval: Duration,
    pub drain_interval: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            // a tenth of the relation decay period
            decay_interval: Duration::from_secs(24 * 360),
            vaccine_sweep_interval: Duration::from_secs(3600),
            silence_check_interval: Duration::from_secs(30),
            gossip_interval: Duration::from_secs(60),
            purge_interval: Duration::from_secs(60),
            drain_interval: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PulseConfig {
    pub transport: TransportConfig,
    pub cache: CacheConfig,
    pub relation: RelationConfig,
    pub criticality: CriticalityConfig,
    pub predictor: PredictorConfig,
    pub evolution: EvolutionConfig,
    pub scheduler: SchedulerConfig,
    pub jobs: JobsConfig,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

impl PulseConfig {
    /// Overlay `PULSE_*` environment variables onto the defaults.
    ///
    /// # Environment Variables
    /// - `PULSE_NODE_ID`, `PULSE_DISPLAY_NAME`, `PULSE_PORT`
    /// - `PULSE_MAX_SILENCE_SECS`: peer eviction threshold (default: 120)
    /// - `PULSE_CACHE_MAX_ENTRIES` (default: 1000)
    /// - `PULSE_CACHE_SIMILARITY_THRESHOLD` (default: 0.85)
    /// - `PULSE_RELATION_DECAY_RATE` (default: 0.01)
    /// - `PULSE_EXPLORATION_INITIAL` (default: 0.2)
    /// - `PULSE_RNG_SEED`: fixed predictor seed (default: unset)
    /// - `PULSE_MAX_VACCINES` (default: 500)
    /// - `PULSE_BACKOFF`: `fixed` or `exponential` (default: exponential)
    /// - `PULSE_TERMINAL_GRACE_SECS` (default: 600)
    /// - `PULSE_GOSSIP_INTERVAL_SECS` (default: 60)
    ///
    /// Unparseable values fall back to the default; call [`validate`](Self::validate)
    /// afterwards to reject out-of-range ones.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(node_id) = std::env::var("PULSE_NODE_ID") {
            config.transport.node_id = node_id;
        }
        if let Ok(name) = std::env::var("PULSE_DISPLAY_NAME") {
            config.transport.display_name = name;
        }
        if let Some(port) = env_parse("PULSE_PORT") {
            config.transport.port = port;
        }
        if let Some(silence) = env_secs("PULSE_MAX_SILENCE_SECS") {
            config.transport.max_silence = silence;
        }
        if let Some(max) = env_parse("PULSE_CACHE_MAX_ENTRIES") {
            config.cache.max_entries = max;
        }
        if let Some(threshold) = env_parse("PULSE_CACHE_SIMILARITY_THRESHOLD") {
            config.cache.similarity_threshold = threshold;
        }
        if let Some(rate) = env_parse("PULSE_RELATION_DECAY_RATE") {
            config.relation.decay_rate = rate;
        }
        if let Some(ratio) = env_parse("PULSE_EXPLORATION_INITIAL") {
            config.criticality.initial_exploration = ratio;
        }
        if let Some(seed) = env_parse("PULSE_RNG_SEED") {
            config.predictor.rng_seed = Some(seed);
        }
        if let Some(max) = env_parse("PULSE_MAX_VACCINES") {
            config.evolution.max_vaccines = max;
        }
        if let Some(kind) = env_parse("PULSE_BACKOFF") {
            config.scheduler.backoff = kind;
        }
        if let Some(grace) = env_secs("PULSE_TERMINAL_GRACE_SECS") {
            config.scheduler.terminal_grace = grace;
        }
        if let Some(interval) = env_secs("PULSE_GOSSIP_INTERVAL_SECS") {
            config.jobs.gossip_interval = interval;
        }

        config
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - thresholds, rates and ratios lie in [0.0, 1.0]
    /// - min/max pairs are ordered
    /// - caps and windows are non-zero
    /// - all durations are positive
    pub fn validate(&self) -> SwarmResult<()> {
        let t = &self.transport;
        if t.node_id.trim().is_empty() {
            return Err(invalid("transport.node_id", &t.node_id, "node_id must not be empty"));
        }
        if t.port == 0 {
            return Err(invalid("transport.port", t.port, "port must be non-zero"));
        }
        if t.default_ttl == 0 {
            return Err(invalid("transport.default_ttl", t.default_ttl, "ttl must be at least 1"));
        }
        if t.max_frame_bytes == 0 || t.max_frame_bytes > MAX_FRAME_BYTES {
            return Err(invalid(
                "transport.max_frame_bytes",
                t.max_frame_bytes,
                "max_frame_bytes must be between 1 and 16 MiB",
            ));
        }
        positive("transport.max_silence", t.max_silence)?;
        positive("transport.connect_timeout", t.connect_timeout)?;
        non_zero("transport.seen_capacity", t.seen_capacity)?;

        let c = &self.cache;
        unit("cache.similarity_threshold", c.similarity_threshold)?;
        unit("cache.share_floor", c.share_floor)?;
        non_zero("cache.max_entries", c.max_entries)?;

        let r = &self.relation;
        unit("relation.ltp_rate", r.ltp_rate)?;
        unit("relation.ltd_rate", r.ltd_rate)?;
        unit("relation.quality_weight", r.quality_weight)?;
        unit("relation.response_time_weight", r.response_time_weight)?;
        unit("relation.initial_strength", r.initial_strength)?;
        unit("relation.decay_rate", r.decay_rate)?;
        unit("relation.mirror_learning_rate", r.mirror_learning_rate)?;
        unit("relation.expertise_learning_rate", r.expertise_learning_rate)?;
        unit("relation.min_strength", r.min_strength)?;
        unit("relation.max_strength", r.max_strength)?;
        positive("relation.decay_period", r.decay_period)?;
        if r.min_strength >= r.max_strength {
            return Err(invalid(
                "relation.min_strength",
                r.min_strength,
                "min_strength must be below max_strength",
            ));
        }
        if r.fast_response_ms >= r.slow_response_ms {
            return Err(invalid(
                "relation.fast_response_ms",
                r.fast_response_ms,
                "fast_response_ms must be below slow_response_ms",
            ));
        }

        let k = &self.criticality;
        unit("criticality.initial_exploration", k.initial_exploration)?;
        unit("criticality.adjustment_step", k.adjustment_step)?;
        unit("criticality.min_exploration", k.min_exploration)?;
        unit("criticality.max_exploration", k.max_exploration)?;
        unit("criticality.low_accuracy_threshold", k.low_accuracy_threshold)?;
        unit("criticality.high_accuracy_threshold", k.high_accuracy_threshold)?;
        unit("criticality.partial_hit_threshold", k.partial_hit_threshold)?;
        non_zero("criticality.accuracy_window", k.accuracy_window)?;
        non_zero("criticality.history_limit", k.history_limit)?;
        if k.min_exploration > k.max_exploration {
            return Err(invalid(
                "criticality.min_exploration",
                k.min_exploration,
                "min_exploration must not exceed max_exploration",
            ));
        }
        if k.initial_exploration < k.min_exploration || k.initial_exploration > k.max_exploration
        {
            return Err(invalid(
                "criticality.initial_exploration",
                k.initial_exploration,
                "initial_exploration must lie within [min_exploration, max_exploration]",
            ));
        }
        if k.low_accuracy_threshold > k.high_accuracy_threshold {
            return Err(invalid(
                "criticality.low_accuracy_threshold",
                k.low_accuracy_threshold,
                "low_accuracy_threshold must not exceed high_accuracy_threshold",
            ));
        }

        let p = &self.predictor;
        if p.latency_ceiling_ms.is_nan() || p.latency_ceiling_ms <= 0.0 {
            return Err(invalid(
                "predictor.latency_ceiling_ms",
                p.latency_ceiling_ms,
                "latency_ceiling_ms must be positive",
            ));
        }
        unit("predictor.busy_load_threshold", p.busy_load_threshold)?;
        unit("predictor.exploration_jitter", p.exploration_jitter)?;
        unit("predictor.history_smoothing", p.history_smoothing)?;
        positive("predictor.imminent_deadline", p.imminent_deadline)?;
        non_zero("predictor.max_pending_predictions", p.max_pending_predictions)?;
        if p.overhead_factor.is_nan() || p.overhead_factor < 1.0 {
            return Err(invalid(
                "predictor.overhead_factor",
                p.overhead_factor,
                "overhead_factor must be at least 1.0",
            ));
        }

        let e = &self.evolution;
        unit("evolution.growth_rate", e.growth_rate)?;
        unit("evolution.vaccine_decay_rate", e.vaccine_decay_rate)?;
        unit("evolution.similarity_threshold", e.similarity_threshold)?;
        if e.base_experience.is_nan() || e.base_experience <= 0.0 {
            return Err(invalid(
                "evolution.base_experience",
                e.base_experience,
                "base_experience must be positive",
            ));
        }
        non_zero("evolution.max_vaccines", e.max_vaccines)?;
        non_zero("evolution.event_capacity", e.event_capacity)?;
        positive("evolution.max_vaccine_age", e.max_vaccine_age)?;

        let s = &self.scheduler;
        positive("scheduler.initial_backoff", s.initial_backoff)?;
        positive("scheduler.max_backoff", s.max_backoff)?;
        positive("scheduler.terminal_grace", s.terminal_grace)?;
        non_zero("scheduler.max_queue_len", s.max_queue_len)?;
        unit("scheduler.local_answer_quality", s.local_answer_quality)?;
        if s.initial_backoff > s.max_backoff {
            return Err(invalid(
                "scheduler.initial_backoff",
                format!("{:?}", s.initial_backoff),
                "initial_backoff must not exceed max_backoff",
            ));
        }
        if s.backoff_multiplier.is_nan() || s.backoff_multiplier < 1.0 {
            return Err(invalid(
                "scheduler.backoff_multiplier",
                s.backoff_multiplier,
                "backoff_multiplier must be at least 1.0",
            ));
        }

        let j = &self.jobs;
        positive("jobs.decay_interval", j.decay_interval)?;
        positive("jobs.vaccine_sweep_interval", j.vaccine_sweep_interval)?;
        positive("jobs.silence_check_interval", j.silence_check_interval)?;
        positive("jobs.gossip_interval", j.gossip_interval)?;
        positive("jobs.purge_interval", j.purge_interval)?;
        positive("jobs.drain_interval", j.drain_interval)?;

        Ok(())
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> SwarmError {
    SwarmError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

fn unit(field: &str, value: f64) -> SwarmResult<()> {
    // NaN fails the range check
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, value, "value must be between 0.0 and 1.0"))
    }
}

fn positive(field: &str, value: Duration) -> SwarmResult<()> {
    if value.is_zero() {
        Err(invalid(field, format!("{:?}", value), "duration must be positive"))
    } else {
        Ok(())
    }
}

fn non_zero(field: &str, value: usize) -> SwarmResult<()> {
    if value == 0 {
        Err(invalid(field, value, "value must be greater than 0"))
    } else {
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn field_of(err: SwarmError) -> String {
        match err {
            SwarmError::Config(ConfigError::InvalidValue { field, .. }) => field,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(PulseConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_constants() {
        let config = PulseConfig::default();
        assert_eq!(config.transport.port, 37373);
        assert_eq!(config.transport.service_type, "_pulsenetwork._tcp");
        assert_eq!(config.relation.ltp_rate, 0.1);
        assert_eq!(config.relation.decay_period, Duration::from_secs(86_400));
        assert_eq!(config.criticality.accuracy_window, 100);
        assert_eq!(config.evolution.max_vaccines, 500);
        assert_eq!(config.scheduler.terminal_grace, Duration::from_secs(600));
        assert_eq!(config.jobs.decay_interval * 10, config.relation.decay_period);
    }

    #[test]
    fn test_inverted_exploration_bounds_rejected() {
        let mut config = PulseConfig::default();
        config.criticality.min_exploration = 0.6;
        config.criticality.max_exploration = 0.3;
        let err = config.validate().unwrap_err();
        assert_eq!(field_of(err), "criticality.min_exploration");
    }

    #[test]
    fn test_zero_cap_rejected() {
        let mut config = PulseConfig::default();
        config.cache.max_entries = 0;
        assert_eq!(field_of(config.validate().unwrap_err()), "cache.max_entries");
    }

    #[test]
    fn test_zero_duration_rejected() {
        let mut config = PulseConfig::default();
        config.jobs.gossip_interval = Duration::ZERO;
        assert_eq!(field_of(config.validate().unwrap_err()), "jobs.gossip_interval");
    }

    #[test]
    fn test_nan_threshold_rejected() {
        let mut config = PulseConfig::default();
        config.evolution.similarity_threshold = f64::NAN;
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "evolution.similarity_threshold"
        );
    }

    #[test]
    fn test_backoff_kind_from_str() {
        assert_eq!("Fixed".parse::<BackoffKind>().unwrap(), BackoffKind::Fixed);
        assert_eq!(
            "exponential".parse::<BackoffKind>().unwrap(),
            BackoffKind::Exponential
        );
        assert!("linear".parse::<BackoffKind>().is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = PulseConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: PulseConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Any threshold outside [0, 1] is rejected.
        #[test]
        fn prop_out_of_range_threshold_rejected(value in prop_oneof![-10.0f64..-0.0001, 1.0001f64..10.0]) {
            let mut config = PulseConfig::default();
            config.cache.similarity_threshold = value;
            prop_assert!(config.validate().is_err());
        }

        /// Any threshold inside [0, 1] is accepted.
        #[test]
        fn prop_in_range_threshold_accepted(value in 0.0f64..=1.0) {
            let mut config = PulseConfig::default();
            config.cache.similarity_threshold = value;
            prop_assert!(config.validate().is_ok());
        }
    }
}
