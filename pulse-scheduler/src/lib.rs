//! PULSE Scheduler - Task Allocation and Node Runtime
//!
//! Ties the swarm together: the [`TaskScheduler`] admits tasks, places them
//! locally or on peers, retries transient failures and feeds every outcome
//! back into the cache, relation, prediction and evolution models. The
//! inbound handler answers peers, and [`run_maintenance`] keeps the models
//! and the peer table fresh.

pub mod handler;
pub mod jobs;
pub mod retry;
pub mod scheduler;
pub mod strategy;

#[cfg(test)]
mod testing;

pub use handler::{run_inbound_loop, OBSERVATION_TOPIC};
pub use jobs::{run_maintenance, MaintenanceMetrics, MaintenanceSnapshot};
pub use retry::{RetryOutcome, RetryPolicy};
pub use scheduler::{answer_text, experience_for, NetworkStats, SubmitOutcome, TaskScheduler};
pub use strategy::{Allocation, AllocationStrategy, CapabilityStrategy, RelationAwareStrategy};
