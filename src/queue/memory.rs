//! In-process broker with the same contract as `RedisBroker`, for tests and
//! local development. Claim deadlines, backoff and the rolling rate-limit
//! window run on tokio time so paused-clock tests stay deterministic.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::models::job::{JobEnvelope, JobState, RetentionPolicy};

use super::{Broker, BrokerError, SweepStats};

const RATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Inner {
    envelopes: HashMap<String, JobEnvelope>,
    waiting: VecDeque<String>,
    /// (ready_at, id) for envelopes sitting out a backoff interval.
    delayed: Vec<(Instant, String)>,
    /// (claim deadline, id) for active envelopes.
    active: Vec<(Instant, String)>,
    completed: VecDeque<(Instant, String)>,
    failed: VecDeque<(Instant, String)>,
    /// Claim grant timestamps within the rolling window.
    claims: VecDeque<Instant>,
}

pub struct MemoryBroker {
    inner: Mutex<Inner>,
    claims_per_second: usize,
    visibility: Duration,
    retention: RetentionPolicy,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            claims_per_second: 10,
            visibility: Duration::from_secs(120),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_claims_per_second(mut self, claims_per_second: usize) -> Self {
        self.claims_per_second = claims_per_second;
        self
    }

    pub fn with_visibility(mut self, visibility: Duration) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Number of envelopes currently claimed. Test observability hook.
    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    fn promote_due(inner: &mut Inner, now: Instant) {
        let mut still_delayed = Vec::new();
        for (ready_at, id) in inner.delayed.drain(..) {
            if ready_at <= now {
                if let Some(env) = inner.envelopes.get_mut(&id) {
                    env.state = JobState::Waiting;
                }
                inner.waiting.push_back(id);
            } else {
                still_delayed.push((ready_at, id));
            }
        }
        inner.delayed = still_delayed;
    }

    fn evict(inner: &mut Inner, retention: &RetentionPolicy, now: Instant) -> u64 {
        let mut evicted = 0;

        let completed_age = Duration::from_secs(retention.completed_age_secs);
        while inner
            .completed
            .front()
            .is_some_and(|(finished, _)| now.duration_since(*finished) >= completed_age)
        {
            if let Some((_, id)) = inner.completed.pop_front() {
                inner.envelopes.remove(&id);
                evicted += 1;
            }
        }
        while inner.completed.len() > retention.completed_max {
            if let Some((_, id)) = inner.completed.pop_front() {
                inner.envelopes.remove(&id);
                evicted += 1;
            }
        }

        let failed_age = Duration::from_secs(retention.failed_age_secs);
        while inner
            .failed
            .front()
            .is_some_and(|(finished, _)| now.duration_since(*finished) >= failed_age)
        {
            if let Some((_, id)) = inner.failed.pop_front() {
                inner.envelopes.remove(&id);
                evicted += 1;
            }
        }

        evicted
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn put(&self, envelope: &JobEnvelope) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner
            .envelopes
            .insert(envelope.id.clone(), envelope.clone());
        inner.waiting.push_back(envelope.id.clone());
        Ok(())
    }

    async fn claim(&self) -> Result<Option<JobEnvelope>, BrokerError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Self::promote_due(&mut inner, now);

        while let Some(front) = inner.claims.front() {
            if now.duration_since(*front) < RATE_WINDOW {
                break;
            }
            inner.claims.pop_front();
        }
        if inner.claims.len() >= self.claims_per_second {
            return Ok(None);
        }

        let Some(id) = inner.waiting.pop_front() else {
            return Ok(None);
        };
        inner.claims.push_back(now);

        let deadline = now + self.visibility;
        inner.active.push((deadline, id.clone()));

        let env = inner
            .envelopes
            .get_mut(&id)
            .ok_or_else(|| BrokerError::Unavailable(format!("lost envelope {id}")))?;
        env.attempts += 1;
        env.state = JobState::Active;
        env.progress = 0;
        env.started_at = Some(Utc::now());
        Ok(Some(env.clone()))
    }

    async fn update_progress(&self, job_id: &str, progress: u8) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        if let Some(env) = inner.envelopes.get_mut(job_id) {
            if env.state == JobState::Active {
                env.progress = progress.min(100);
            }
        }
        Ok(())
    }

    async fn complete(&self, job_id: &str, result: serde_json::Value) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.active.retain(|(_, id)| id != job_id);
        if let Some(env) = inner.envelopes.get_mut(job_id) {
            env.state = JobState::Completed;
            env.progress = 100;
            env.result = Some(result);
            env.failure_reason = None;
            env.finished_at = Some(Utc::now());
        }
        inner.completed.push_back((now, job_id.to_string()));
        Self::evict(&mut inner, &self.retention, now);
        Ok(())
    }

    async fn retry(&self, job_id: &str, delay: Duration) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.active.retain(|(_, id)| id != job_id);
        if let Some(env) = inner.envelopes.get_mut(job_id) {
            env.state = JobState::Delayed;
        }
        inner.delayed.push((now + delay, job_id.to_string()));
        Ok(())
    }

    async fn fail(&self, job_id: &str, reason: &str) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.active.retain(|(_, id)| id != job_id);
        if let Some(env) = inner.envelopes.get_mut(job_id) {
            env.state = JobState::Failed;
            env.result = None;
            env.failure_reason = Some(reason.to_string());
            env.finished_at = Some(Utc::now());
        }
        inner.failed.push_back((now, job_id.to_string()));
        Ok(())
    }

    async fn fetch(&self, job_id: &str) -> Result<Option<JobEnvelope>, BrokerError> {
        let inner = self.inner.lock().await;
        Ok(inner.envelopes.get(job_id).cloned())
    }

    async fn sweep(&self) -> Result<SweepStats, BrokerError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let mut stats = SweepStats::default();

        Self::promote_due(&mut inner, now);

        let mut still_active = Vec::new();
        let active = std::mem::take(&mut inner.active);
        for (deadline, id) in active {
            if deadline <= now {
                if let Some(env) = inner.envelopes.get_mut(&id) {
                    env.state = JobState::Waiting;
                }
                inner.waiting.push_back(id);
                stats.requeued += 1;
            } else {
                still_active.push((deadline, id));
            }
        }
        inner.active = still_active;

        stats.evicted = Self::evict(&mut inner, &self.retention, now);
        Ok(stats)
    }

    async fn queue_depth(&self) -> Result<u64, BrokerError> {
        Ok(self.inner.lock().await.waiting.len() as u64)
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{new_job_id, RetryPolicy};

    fn envelope() -> JobEnvelope {
        JobEnvelope::new(
            new_job_id(),
            serde_json::json!({}),
            RetryPolicy::default(),
            RetentionPolicy::default(),
        )
    }

    #[tokio::test]
    async fn claim_increments_attempts_and_activates() {
        let broker = MemoryBroker::new();
        let env = envelope();
        broker.put(&env).await.unwrap();

        let claimed = broker.claim().await.unwrap().unwrap();
        assert_eq!(claimed.id, env.id);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.progress, 0);
        assert!(claimed.started_at.is_some());
        assert_eq!(broker.active_count().await, 1);
    }

    #[tokio::test]
    async fn claim_on_empty_queue_returns_none() {
        let broker = MemoryBroker::new();
        assert!(broker.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn an_envelope_is_claimed_at_most_once_per_attempt() {
        let broker = MemoryBroker::new();
        broker.put(&envelope()).await.unwrap();

        assert!(broker.claim().await.unwrap().is_some());
        // The same attempt is never handed out twice.
        assert!(broker.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rate_limit_caps_claims_per_window() {
        let broker = MemoryBroker::new();
        for _ in 0..15 {
            broker.put(&envelope()).await.unwrap();
        }

        let mut granted = 0;
        for _ in 0..15 {
            if broker.claim().await.unwrap().is_some() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);

        // A fresh window grants claims again.
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        assert!(broker.claim().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_requeues_stalled_claims() {
        let broker = MemoryBroker::new().with_visibility(Duration::from_millis(20));
        let env = envelope();
        broker.put(&env).await.unwrap();
        broker.claim().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = broker.sweep().await.unwrap();
        assert_eq!(stats.requeued, 1);

        let fetched = broker.fetch(&env.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, JobState::Waiting);

        // Second claim is a fresh attempt on the same envelope.
        let reclaimed = broker.claim().await.unwrap().unwrap();
        assert_eq!(reclaimed.id, env.id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn retention_evicts_by_completed_count() {
        let retention = RetentionPolicy {
            completed_max: 2,
            ..RetentionPolicy::default()
        };
        let broker = MemoryBroker::new()
            .with_claims_per_second(100)
            .with_retention(retention);

        let mut ids = Vec::new();
        for _ in 0..4 {
            let env = envelope();
            ids.push(env.id.clone());
            broker.put(&env).await.unwrap();
            broker.claim().await.unwrap().unwrap();
            broker.complete(&env.id, serde_json::json!({"ok": true})).await.unwrap();
        }

        // Oldest two are gone, newest two survive.
        assert!(broker.fetch(&ids[0]).await.unwrap().is_none());
        assert!(broker.fetch(&ids[1]).await.unwrap().is_none());
        assert!(broker.fetch(&ids[2]).await.unwrap().is_some());
        assert!(broker.fetch(&ids[3]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn retention_evicts_completed_by_age() {
        let retention = RetentionPolicy {
            completed_age_secs: 0,
            ..RetentionPolicy::default()
        };
        let broker = MemoryBroker::new().with_retention(retention);

        let env = envelope();
        broker.put(&env).await.unwrap();
        broker.claim().await.unwrap().unwrap();
        broker.complete(&env.id, serde_json::json!({})).await.unwrap();
        broker.sweep().await.unwrap();

        assert!(broker.fetch(&env.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_updates_ignored_outside_active() {
        let broker = MemoryBroker::new();
        let env = envelope();
        broker.put(&env).await.unwrap();

        broker.update_progress(&env.id, 50).await.unwrap();
        assert_eq!(broker.fetch(&env.id).await.unwrap().unwrap().progress, 0);

        broker.claim().await.unwrap().unwrap();
        broker.update_progress(&env.id, 50).await.unwrap();
        assert_eq!(broker.fetch(&env.id).await.unwrap().unwrap().progress, 50);
    }
}
