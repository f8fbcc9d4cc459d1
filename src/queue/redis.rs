//! Redis-backed broker.
//!
//! Envelope JSON lives under `species_id:job:{id}`; the waiting set is a
//! list, and claims RPOPLPUSH from it into a claiming list so the id is
//! always indexed somewhere, even if the claimer dies mid-hand-off. Delayed
//! and active sets are zsets scored by ready time and claim deadline, and
//! terminal envelopes are tracked in zsets scored by finish time for
//! retention. The claim rate limit is an atomic counter on a per-second
//! window key, so it holds across worker pool instances sharing the queue.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::models::job::{JobEnvelope, JobState, RetentionPolicy};

use super::{Broker, BrokerError, SweepStats};

const KEY_JOB_PREFIX: &str = "species_id:job";
const KEY_WAITING: &str = "species_id:waiting";
const KEY_CLAIMING: &str = "species_id:claiming";
const KEY_DELAYED: &str = "species_id:delayed";
const KEY_ACTIVE: &str = "species_id:active";
const KEY_COMPLETED: &str = "species_id:completed";
const KEY_FAILED: &str = "species_id:failed";
const KEY_CLAIMS: &str = "species_id:claims";

fn job_key(id: &str) -> String {
    format!("{KEY_JOB_PREFIX}:{id}")
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct RedisBroker {
    client: redis::Client,
    claims_per_second: u64,
    visibility: Duration,
    retention: RetentionPolicy,
    /// Claiming-list ids seen by the previous sweep with no active deadline.
    /// A second sighting means the claimer died mid-hand-off.
    suspect_claims: tokio::sync::Mutex<HashSet<String>>,
}

impl RedisBroker {
    pub fn new(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(BrokerError::Redis)?;
        Ok(Self {
            client,
            claims_per_second: 10,
            visibility: Duration::from_secs(120),
            retention: RetentionPolicy::default(),
            suspect_claims: tokio::sync::Mutex::new(HashSet::new()),
        })
    }

    pub fn with_claims_per_second(mut self, claims_per_second: u64) -> Self {
        self.claims_per_second = claims_per_second;
        self
    }

    /// How long a claim may stay active before the sweeper treats the worker
    /// as crashed and requeues the envelope.
    pub fn with_visibility(mut self, visibility: Duration) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    async fn conn(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(BrokerError::Redis)
    }

    async fn load(
        &self,
        conn: &mut MultiplexedConnection,
        id: &str,
    ) -> Result<Option<JobEnvelope>, BrokerError> {
        let raw: Option<String> = conn.get(job_key(id)).await.map_err(BrokerError::Redis)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json).map_err(BrokerError::Serialize)?)),
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        conn: &mut MultiplexedConnection,
        envelope: &JobEnvelope,
    ) -> Result<(), BrokerError> {
        let json = serde_json::to_string(envelope).map_err(BrokerError::Serialize)?;
        conn.set::<_, _, ()>(job_key(&envelope.id), json)
            .await
            .map_err(BrokerError::Redis)?;
        Ok(())
    }

    /// Move delayed envelopes whose backoff has elapsed back to the waiting
    /// list. The ZREM result guards against another pool promoting the same
    /// id concurrently.
    async fn promote_due(&self, conn: &mut MultiplexedConnection) -> Result<(), BrokerError> {
        let due: Vec<String> = conn
            .zrangebyscore(KEY_DELAYED, "-inf", now_ms())
            .await
            .map_err(BrokerError::Redis)?;

        for id in due {
            let removed: i64 = conn
                .zrem(KEY_DELAYED, &id)
                .await
                .map_err(BrokerError::Redis)?;
            if removed != 1 {
                continue;
            }
            if let Some(mut env) = self.load(conn, &id).await? {
                env.state = JobState::Waiting;
                self.save(conn, &env).await?;
            }
            conn.lpush::<_, _, ()>(KEY_WAITING, &id)
                .await
                .map_err(BrokerError::Redis)?;
        }
        Ok(())
    }

    /// Atomically reserve one claim slot in the current one-second window.
    async fn reserve_claim_slot(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<bool, BrokerError> {
        let window_key = format!("{KEY_CLAIMS}:{}", Utc::now().timestamp());
        let granted: u64 = conn.incr(&window_key, 1u64).await.map_err(BrokerError::Redis)?;
        conn.expire::<_, ()>(&window_key, 2)
            .await
            .map_err(BrokerError::Redis)?;
        Ok(granted <= self.claims_per_second)
    }

    /// Evict zset members older than `cutoff_ms`, deleting their envelopes.
    async fn evict_older_than(
        &self,
        conn: &mut MultiplexedConnection,
        key: &str,
        cutoff_ms: i64,
    ) -> Result<u64, BrokerError> {
        let expired: Vec<String> = conn
            .zrangebyscore(key, "-inf", cutoff_ms)
            .await
            .map_err(BrokerError::Redis)?;
        for id in &expired {
            conn.del::<_, ()>(job_key(id)).await.map_err(BrokerError::Redis)?;
            conn.zrem::<_, _, ()>(key, id).await.map_err(BrokerError::Redis)?;
        }
        Ok(expired.len() as u64)
    }

    /// Trim the completed set down to the retained count, oldest first.
    async fn trim_completed(&self, conn: &mut MultiplexedConnection) -> Result<u64, BrokerError> {
        let count: u64 = conn.zcard(KEY_COMPLETED).await.map_err(BrokerError::Redis)?;
        let max = self.retention.completed_max as u64;
        if count <= max {
            return Ok(0);
        }
        let excess = (count - max) as isize;
        let oldest: Vec<String> = conn
            .zrange(KEY_COMPLETED, 0, excess - 1)
            .await
            .map_err(BrokerError::Redis)?;
        for id in &oldest {
            conn.del::<_, ()>(job_key(id)).await.map_err(BrokerError::Redis)?;
            conn.zrem::<_, _, ()>(KEY_COMPLETED, id)
                .await
                .map_err(BrokerError::Redis)?;
        }
        Ok(oldest.len() as u64)
    }
}

#[async_trait::async_trait]
impl Broker for RedisBroker {
    async fn put(&self, envelope: &JobEnvelope) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        self.save(&mut conn, envelope).await?;
        conn.lpush::<_, _, ()>(KEY_WAITING, &envelope.id)
            .await
            .map_err(BrokerError::Redis)?;
        Ok(())
    }

    async fn claim(&self) -> Result<Option<JobEnvelope>, BrokerError> {
        let mut conn = self.conn().await?;
        self.promote_due(&mut conn).await?;

        if !self.reserve_claim_slot(&mut conn).await? {
            return Ok(None);
        }

        // RPOPLPUSH hands each id to exactly one claimer across all pools,
        // and parks it in the claiming list so a claimer that dies before
        // registering the deadline leaves a trail for the sweeper.
        let id: Option<String> = conn
            .rpoplpush(KEY_WAITING, KEY_CLAIMING)
            .await
            .map_err(BrokerError::Redis)?;
        let Some(id) = id else { return Ok(None) };

        let deadline = now_ms() + self.visibility.as_millis() as i64;
        conn.zadd::<_, _, _, ()>(KEY_ACTIVE, &id, deadline)
            .await
            .map_err(BrokerError::Redis)?;
        conn.lrem::<_, _, ()>(KEY_CLAIMING, 1, &id)
            .await
            .map_err(BrokerError::Redis)?;

        let Some(mut env) = self.load(&mut conn, &id).await? else {
            // Envelope evicted between enqueue and claim; drop the claim.
            conn.zrem::<_, _, ()>(KEY_ACTIVE, &id)
                .await
                .map_err(BrokerError::Redis)?;
            return Ok(None);
        };

        env.attempts += 1;
        env.state = JobState::Active;
        env.progress = 0;
        env.started_at = Some(Utc::now());
        self.save(&mut conn, &env).await?;

        Ok(Some(env))
    }

    async fn update_progress(&self, job_id: &str, progress: u8) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let key = job_key(job_id);

        // WATCH the envelope so the write aborts if a sweep requeues the job
        // between our read and the save. Progress is best-effort, so an
        // aborted transaction is dropped, not retried.
        redis::cmd("WATCH")
            .arg(&key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(BrokerError::Redis)?;

        let mut env = match self.load(&mut conn, job_id).await? {
            Some(env) if env.state == JobState::Active => env,
            _ => {
                redis::cmd("UNWATCH")
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(BrokerError::Redis)?;
                return Ok(());
            }
        };
        env.progress = progress.min(100);
        let json = serde_json::to_string(&env).map_err(BrokerError::Serialize)?;

        let _: Option<()> = redis::pipe()
            .atomic()
            .set(&key, json)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(BrokerError::Redis)?;
        Ok(())
    }

    async fn complete(&self, job_id: &str, result: serde_json::Value) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        if let Some(mut env) = self.load(&mut conn, job_id).await? {
            env.state = JobState::Completed;
            env.progress = 100;
            env.result = Some(result);
            env.failure_reason = None;
            env.finished_at = Some(Utc::now());
            self.save(&mut conn, &env).await?;
        }
        conn.zrem::<_, _, ()>(KEY_ACTIVE, job_id)
            .await
            .map_err(BrokerError::Redis)?;
        conn.zadd::<_, _, _, ()>(KEY_COMPLETED, job_id, now_ms())
            .await
            .map_err(BrokerError::Redis)?;
        self.trim_completed(&mut conn).await?;
        Ok(())
    }

    async fn retry(&self, job_id: &str, delay: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        if let Some(mut env) = self.load(&mut conn, job_id).await? {
            env.state = JobState::Delayed;
            self.save(&mut conn, &env).await?;
        }
        conn.zrem::<_, _, ()>(KEY_ACTIVE, job_id)
            .await
            .map_err(BrokerError::Redis)?;
        let ready_at = now_ms() + delay.as_millis() as i64;
        conn.zadd::<_, _, _, ()>(KEY_DELAYED, job_id, ready_at)
            .await
            .map_err(BrokerError::Redis)?;
        Ok(())
    }

    async fn fail(&self, job_id: &str, reason: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        if let Some(mut env) = self.load(&mut conn, job_id).await? {
            env.state = JobState::Failed;
            env.result = None;
            env.failure_reason = Some(reason.to_string());
            env.finished_at = Some(Utc::now());
            self.save(&mut conn, &env).await?;
        }
        conn.zrem::<_, _, ()>(KEY_ACTIVE, job_id)
            .await
            .map_err(BrokerError::Redis)?;
        conn.zadd::<_, _, _, ()>(KEY_FAILED, job_id, now_ms())
            .await
            .map_err(BrokerError::Redis)?;
        Ok(())
    }

    async fn fetch(&self, job_id: &str) -> Result<Option<JobEnvelope>, BrokerError> {
        let mut conn = self.conn().await?;
        self.load(&mut conn, job_id).await
    }

    async fn sweep(&self) -> Result<SweepStats, BrokerError> {
        let mut conn = self.conn().await?;
        let mut stats = SweepStats::default();

        self.promote_due(&mut conn).await?;

        // Stall recovery: actives past their claim deadline go back to
        // waiting so another worker can claim them.
        let stalled: Vec<String> = conn
            .zrangebyscore(KEY_ACTIVE, "-inf", now_ms())
            .await
            .map_err(BrokerError::Redis)?;
        for id in stalled {
            let removed: i64 = conn.zrem(KEY_ACTIVE, &id).await.map_err(BrokerError::Redis)?;
            if removed != 1 {
                continue;
            }
            if let Some(mut env) = self.load(&mut conn, &id).await? {
                env.state = JobState::Waiting;
                self.save(&mut conn, &env).await?;
                conn.lpush::<_, _, ()>(KEY_WAITING, &id)
                    .await
                    .map_err(BrokerError::Redis)?;
                stats.requeued += 1;
                tracing::warn!(job_id = %id, "Requeued stalled job");
            }
        }

        // Claim hand-off recovery: an id parked in the claiming list with no
        // active deadline belongs to a claim in flight, or to a claimer that
        // died between the pop and the deadline registration. Requeue it only
        // on a second sighting, so an in-flight claim is never stolen.
        let parked: Vec<String> = conn
            .lrange(KEY_CLAIMING, 0, -1)
            .await
            .map_err(BrokerError::Redis)?;
        let prior_suspects = std::mem::take(&mut *self.suspect_claims.lock().await);
        let mut suspects = HashSet::new();
        for id in parked {
            let registered: Option<i64> =
                conn.zscore(KEY_ACTIVE, &id).await.map_err(BrokerError::Redis)?;
            if registered.is_some() {
                // Deadline made it in before the crash; the active sweep owns
                // this id now.
                conn.lrem::<_, _, ()>(KEY_CLAIMING, 1, &id)
                    .await
                    .map_err(BrokerError::Redis)?;
                continue;
            }
            if !prior_suspects.contains(&id) {
                suspects.insert(id);
                continue;
            }
            let removed: i64 = conn
                .lrem(KEY_CLAIMING, 1, &id)
                .await
                .map_err(BrokerError::Redis)?;
            if removed != 1 {
                continue;
            }
            if let Some(mut env) = self.load(&mut conn, &id).await? {
                env.state = JobState::Waiting;
                self.save(&mut conn, &env).await?;
                conn.lpush::<_, _, ()>(KEY_WAITING, &id)
                    .await
                    .map_err(BrokerError::Redis)?;
                stats.requeued += 1;
                tracing::warn!(job_id = %id, "Requeued job lost mid-claim");
            }
        }
        *self.suspect_claims.lock().await = suspects;

        let completed_cutoff = now_ms() - (self.retention.completed_age_secs as i64) * 1_000;
        stats.evicted += self
            .evict_older_than(&mut conn, KEY_COMPLETED, completed_cutoff)
            .await?;
        stats.evicted += self.trim_completed(&mut conn).await?;

        let failed_cutoff = now_ms() - (self.retention.failed_age_secs as i64) * 1_000;
        stats.evicted += self.evict_older_than(&mut conn, KEY_FAILED, failed_cutoff).await?;

        Ok(stats)
    }

    async fn queue_depth(&self) -> Result<u64, BrokerError> {
        let mut conn = self.conn().await?;
        let depth: u64 = conn.llen(KEY_WAITING).await.map_err(BrokerError::Redis)?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(BrokerError::Redis)?;
        Ok(())
    }
}
