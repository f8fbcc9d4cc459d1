use std::sync::Arc;

use crate::models::job::{new_job_id, JobEnvelope, RetentionPolicy, RetryPolicy};

use super::codec::{self, JobPayload};
use super::{Broker, BrokerError};

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The broker could not durably record the envelope. No job id exists
    /// and the caller must not assume one was created.
    #[error("Job queue unavailable: {0}")]
    QueueUnavailable(#[source] BrokerError),
}

/// Enqueues identification jobs, assigning identity and retry/retention
/// policy. Does not wait for execution.
pub struct Producer {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
    retention: RetentionPolicy,
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            retry: RetryPolicy::default(),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Durably record a new envelope and return its id.
    pub async fn enqueue(&self, payload: &JobPayload) -> Result<String, EnqueueError> {
        let id = new_job_id();
        let envelope = JobEnvelope::new(id.clone(), codec::encode(payload), self.retry, self.retention);

        self.broker
            .put(&envelope)
            .await
            .map_err(EnqueueError::QueueUnavailable)?;

        tracing::info!(
            job_id = %id,
            bytes = payload.image_bytes.len(),
            mime_type = %payload.mime_type,
            "Enqueued identification job"
        );
        metrics::counter!("identify_jobs_enqueued").increment(1);

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobState;
    use crate::queue::{MemoryBroker, SweepStats};

    fn payload() -> JobPayload {
        JobPayload {
            image_bytes: vec![1, 2, 3, 4],
            mime_type: "image/jpeg".to_string(),
            original_file_name: "heron.jpg".to_string(),
            user_id: None,
        }
    }

    #[tokio::test]
    async fn enqueue_records_waiting_envelope() {
        let broker = Arc::new(MemoryBroker::new());
        let producer = Producer::new(broker.clone());

        let id = producer.enqueue(&payload()).await.unwrap();

        let env = broker.fetch(&id).await.unwrap().unwrap();
        assert_eq!(env.state, JobState::Waiting);
        assert_eq!(env.attempts, 0);
        assert_eq!(env.retry.max_attempts, 3);
        assert_eq!(env.retry.backoff_base_ms, 2_000);
        assert_eq!(broker.queue_depth().await.unwrap(), 1);

        let decoded = codec::decode(&env.payload).unwrap();
        assert_eq!(decoded, payload());
    }

    /// Broker that refuses every operation, standing in for an unreachable
    /// Redis.
    struct DownBroker;

    #[async_trait::async_trait]
    impl Broker for DownBroker {
        async fn put(&self, _: &JobEnvelope) -> Result<(), BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }
        async fn claim(&self) -> Result<Option<JobEnvelope>, BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }
        async fn update_progress(&self, _: &str, _: u8) -> Result<(), BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }
        async fn complete(&self, _: &str, _: serde_json::Value) -> Result<(), BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }
        async fn retry(&self, _: &str, _: std::time::Duration) -> Result<(), BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }
        async fn fail(&self, _: &str, _: &str) -> Result<(), BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }
        async fn fetch(&self, _: &str) -> Result<Option<JobEnvelope>, BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }
        async fn sweep(&self) -> Result<SweepStats, BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }
        async fn queue_depth(&self) -> Result<u64, BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }
        async fn health_check(&self) -> Result<(), BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn unreachable_broker_yields_queue_unavailable() {
        let producer = Producer::new(Arc::new(DownBroker));
        let err = producer.enqueue(&payload()).await.unwrap_err();
        assert!(matches!(err, EnqueueError::QueueUnavailable(_)));
    }
}
