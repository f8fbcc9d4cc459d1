//! Durable job queue: broker abstraction, producer, status reader and the
//! payload codec.
//!
//! The broker is the authority for claim exclusivity, the shared claim rate
//! limit, stall recovery and retention. `RedisBroker` is the production
//! implementation; `MemoryBroker` offers the same contract in-process for
//! tests and local development.

use std::time::Duration;

use async_trait::async_trait;

use crate::models::job::JobEnvelope;

pub mod codec;
pub mod memory;
pub mod producer;
pub mod redis;
pub mod status;

pub use self::memory::MemoryBroker;
pub use self::producer::{EnqueueError, Producer};
pub use self::redis::RedisBroker;
pub use self::status::StatusReader;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// Counts reported by a sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Stalled active envelopes returned to the waiting set.
    pub requeued: u64,
    /// Terminal envelopes evicted by retention.
    pub evicted: u64,
}

/// Durable-queue primitives the core delegates to.
///
/// All envelope mutation flows through these methods; workers never write to
/// a shared envelope directly. `claim` is an atomic hand-off: at most one
/// caller receives a given envelope per attempt.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Durably record a new envelope in the waiting set.
    async fn put(&self, envelope: &JobEnvelope) -> Result<(), BrokerError>;

    /// Claim the next ready envelope, if any, under the shared claim rate
    /// limit. On success the envelope has been transitioned to `Active` with
    /// `attempts` incremented, `progress` reset and `started_at` refreshed.
    async fn claim(&self) -> Result<Option<JobEnvelope>, BrokerError>;

    /// Best-effort progress update; ignored unless the envelope is `Active`.
    async fn update_progress(&self, job_id: &str, progress: u8) -> Result<(), BrokerError>;

    /// Transition an active envelope to `Completed` with its result.
    async fn complete(&self, job_id: &str, result: serde_json::Value) -> Result<(), BrokerError>;

    /// Return an active envelope to the waiting set after `delay` (it sits in
    /// `Delayed` until the backoff elapses).
    async fn retry(&self, job_id: &str, delay: Duration) -> Result<(), BrokerError>;

    /// Transition an active envelope to terminal `Failed`.
    async fn fail(&self, job_id: &str, reason: &str) -> Result<(), BrokerError>;

    /// Read an envelope without mutating it.
    async fn fetch(&self, job_id: &str) -> Result<Option<JobEnvelope>, BrokerError>;

    /// Requeue stalled actives past their claim deadline and evict terminal
    /// envelopes per retention.
    async fn sweep(&self) -> Result<SweepStats, BrokerError>;

    /// Number of envelopes currently waiting.
    async fn queue_depth(&self) -> Result<u64, BrokerError>;

    /// Connectivity check (for health endpoints).
    async fn health_check(&self) -> Result<(), BrokerError>;
}
