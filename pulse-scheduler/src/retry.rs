//! Retry with backoff for task attempts

use pulse_core::{BackoffKind, SchedulerConfig, SwarmResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryPolicy {
    Fixed {
        delay: Duration,
    },
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

/// Result of [`RetryPolicy::run`].
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The successful value, or the error of the last attempt
    pub result: SwarmResult<T>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        match config.backoff {
            BackoffKind::Fixed => RetryPolicy::Fixed {
                delay: config.initial_backoff,
            },
            BackoffKind::Exponential => RetryPolicy::Exponential {
                initial: config.initial_backoff,
                max: config.max_backoff,
                multiplier: config.backoff_multiplier,
            },
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed { delay } => delay,
            RetryPolicy::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exponent = retry.saturating_sub(1).min(63) as i32;
                let nanos = initial.as_nanos() as f64 * multiplier.max(1.0).powi(exponent);
                if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
                    max
                } else {
                    Duration::from_nanos(nanos as u64)
                }
            }
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` attempts have been made. `op` receives the 1-based
    /// attempt number.
    pub async fn run<T, F, Fut>(&self, max_attempts: u32, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SwarmResult<T>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => {
                    return RetryOutcome {
                        result,
                        attempts: attempt,
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}
