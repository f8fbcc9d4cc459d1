use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of an identification job in the async queue.
///
/// `Delayed` is the backoff interval between a failed attempt and the next
/// retry; `Completed` and `Failed` are terminal.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Retry policy stamped on an envelope at enqueue time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after attempt `n` (1-based) has failed:
    /// `base * 2^(n-1)`, capped.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }
}

/// Retention policy for terminal envelopes. Advisory cleanup, not a
/// correctness guarantee: an evicted job reads the same as one that never
/// existed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_age_secs: u64,
    pub completed_max: usize,
    pub failed_age_secs: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_age_secs: 3_600,
            completed_max: 100,
            failed_age_secs: 86_400,
        }
    }
}

/// Durable record of one unit of enqueued work.
///
/// Created by the producer, mutated only through the broker's claim/update
/// primitives, projected read-only by the status reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: String,
    /// Codec wire form of the payload (see `queue::codec`).
    pub payload: serde_json::Value,
    pub state: JobState,
    pub progress: u8,
    pub attempts: u32,
    pub retry: RetryPolicy,
    pub retention: RetentionPolicy,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobEnvelope {
    pub fn new(
        id: String,
        payload: serde_json::Value,
        retry: RetryPolicy,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            id,
            payload,
            state: JobState::Waiting,
            progress: 0,
            attempts: 0,
            retry,
            retention,
            result: None,
            failure_reason: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Generate a job identifier: millisecond timestamp prefix plus a random
/// suffix. Uniqueness is the requirement, not orderability.
pub fn new_job_id() -> String {
    format!("{}-{}", Utc::now().timestamp_millis(), Uuid::new_v4().simple())
}

/// Client-facing projection of an envelope's current lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: String,
    pub state: JobState,
    pub progress: u8,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&JobEnvelope> for JobStatusView {
    fn from(env: &JobEnvelope) -> Self {
        Self {
            id: env.id.clone(),
            state: env.state,
            progress: env.progress,
            attempts: env.attempts,
            result: env.result.clone(),
            failure_reason: env.failure_reason.clone(),
            enqueued_at: env.enqueued_at,
            started_at: env.started_at,
            finished_at: env.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_after(1), Duration::from_millis(2_000));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(4_000));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(8_000));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 60_000,
        };
        assert_eq!(policy.backoff_after(9), Duration::from_millis(60_000));
        // Large attempt numbers must not overflow the shift.
        assert_eq!(policy.backoff_after(u32::MAX), Duration::from_millis(60_000));
    }

    #[test]
    fn job_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobState::Waiting).unwrap(),
            "\"waiting\""
        );
        assert_eq!(JobState::Delayed.to_string(), "delayed");
    }

    #[test]
    fn job_ids_are_unique() {
        let mut ids: Vec<String> = (0..1_000).map(|_| new_job_id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 1_000);
    }

    #[test]
    fn new_envelope_starts_waiting() {
        let env = JobEnvelope::new(
            new_job_id(),
            serde_json::json!({}),
            RetryPolicy::default(),
            RetentionPolicy::default(),
        );
        assert_eq!(env.state, JobState::Waiting);
        assert_eq!(env.attempts, 0);
        assert!(env.result.is_none());
        assert!(env.failure_reason.is_none());
        assert!(env.started_at.is_none());
    }
}
