//! Worker pool: drains the queue under concurrency and rate limits, runs the
//! identification pipeline and translates every pipeline failure into an
//! envelope state transition. Pipeline errors never escape a worker task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use crate::db::records::{RecordError, RecordStore};
use crate::models::job::JobEnvelope;
use crate::queue::codec::{self, CodecError};
use crate::queue::Broker;
use crate::services::classifier::{Classifier, ClassifyError};
use crate::services::storage::{ObjectStore, StorageError};

/// Collection the final identification record is persisted into.
const RECORDS_COLLECTION: &str = "identifications";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    Payload(#[from] CodecError),

    #[error("Classification failed: {0}")]
    Classify(#[from] ClassifyError),

    #[error("Classification timed out")]
    ClassifyTimeout,

    #[error("Image storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Record persistence failed: {0}")]
    Record(#[from] RecordError),
}

/// Completion/failure callbacks scoped to one pool instance, passed in at
/// construction rather than registered as process-wide listeners.
pub trait JobObserver: Send + Sync {
    fn on_completed(&self, _job_id: &str, _result: &serde_json::Value) {}
    fn on_retried(&self, _job_id: &str, _attempt: u32, _delay: Duration) {}
    fn on_failed(&self, _job_id: &str, _reason: &str) {}
}

/// Default observer: structured logs only.
pub struct LogObserver;

impl JobObserver for LogObserver {
    fn on_completed(&self, job_id: &str, _result: &serde_json::Value) {
        tracing::info!(job_id = %job_id, "Job completed");
    }

    fn on_retried(&self, job_id: &str, attempt: u32, delay: Duration) {
        tracing::info!(
            job_id = %job_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Job re-queued for retry"
        );
    }

    fn on_failed(&self, job_id: &str, reason: &str) {
        tracing::warn!(job_id = %job_id, reason = %reason, "Job failed terminally");
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum envelopes active at once in this pool instance.
    pub concurrency: usize,
    /// Sleep between claim attempts when the queue is empty or rate-limited.
    pub poll_interval: Duration,
    /// Interval of the stall-recovery / retention sweep.
    pub sweep_interval: Duration,
    /// Deadline on the classification call; expiry is a recoverable error.
    pub classify_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(250),
            sweep_interval: Duration::from_secs(5),
            classify_timeout: Duration::from_secs(30),
        }
    }
}

pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    classifier: Arc<dyn Classifier>,
    storage: Arc<dyn ObjectStore>,
    records: Arc<dyn RecordStore>,
    observer: Arc<dyn JobObserver>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        classifier: Arc<dyn Classifier>,
        storage: Arc<dyn ObjectStore>,
        records: Arc<dyn RecordStore>,
        observer: Arc<dyn JobObserver>,
        config: WorkerPoolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            classifier,
            storage,
            records,
            observer,
            config,
        })
    }

    /// Main processing loop; runs until the surrounding task is dropped.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            concurrency = self.config.concurrency,
            "Worker pool ready, starting job processing loop"
        );

        let sweeper = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(sweeper.config.sweep_interval).await;
                match sweeper.broker.sweep().await {
                    Ok(stats) if stats.requeued > 0 || stats.evicted > 0 => {
                        tracing::info!(
                            requeued = stats.requeued,
                            evicted = stats.evicted,
                            "Sweep pass"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Sweep failed"),
                }
                if let Ok(depth) = sweeper.broker.queue_depth().await {
                    metrics::gauge!("identify_queue_depth").set(depth as f64);
                }
            }
        });

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        loop {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            match self.broker.claim().await {
                Ok(Some(envelope)) => {
                    let pool = self.clone();
                    tokio::spawn(async move {
                        pool.process(envelope).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Claim failed, backing off");
                    sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Execute one claimed attempt and report the outcome to the broker.
    async fn process(&self, envelope: JobEnvelope) {
        let job_id = envelope.id.clone();
        tracing::info!(job_id = %job_id, attempt = envelope.attempts, "Processing job");

        match self.run_pipeline(&envelope).await {
            Ok(result) => {
                if let Err(e) = self.broker.complete(&job_id, result.clone()).await {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record completion");
                    return;
                }
                metrics::counter!("identify_jobs_completed").increment(1);
                self.observer.on_completed(&job_id, &result);
            }
            Err(err) => {
                let reason = err.to_string();
                tracing::error!(job_id = %job_id, error = %reason, "Pipeline attempt failed");

                if envelope.attempts >= envelope.retry.max_attempts {
                    if let Err(e) = self.broker.fail(&job_id, &reason).await {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to record failure");
                        return;
                    }
                    metrics::counter!("identify_jobs_failed").increment(1);
                    self.observer.on_failed(&job_id, &reason);
                } else {
                    let delay = envelope.retry.backoff_after(envelope.attempts);
                    if let Err(e) = self.broker.retry(&job_id, delay).await {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to schedule retry");
                        return;
                    }
                    metrics::counter!("identify_jobs_retried").increment(1);
                    self.observer.on_retried(&job_id, envelope.attempts, delay);
                }
            }
        }
    }

    /// The fixed pipeline: decode, classify, store the image, persist the
    /// identification record.
    async fn run_pipeline(&self, envelope: &JobEnvelope) -> Result<serde_json::Value, PipelineError> {
        let payload = codec::decode(&envelope.payload)?;
        self.report_progress(&envelope.id, 10).await;

        self.report_progress(&envelope.id, 30).await;
        let start = Instant::now();
        let classification = tokio::time::timeout(
            self.config.classify_timeout,
            self.classifier
                .classify(&payload.image_bytes, &payload.mime_type),
        )
        .await
        .map_err(|_| PipelineError::ClassifyTimeout)??;
        metrics::histogram!("classification_seconds").record(start.elapsed().as_secs_f64());

        tracing::debug!(
            job_id = %envelope.id,
            label = %classification.label,
            duration_ms = start.elapsed().as_millis() as u64,
            "Classification complete"
        );
        self.report_progress(&envelope.id, 60).await;

        let destination = format!(
            "identifications/{}/{}",
            envelope.id, payload.original_file_name
        );
        let image_url = self
            .storage
            .store(&payload.image_bytes, &destination, &payload.mime_type)
            .await?;
        self.report_progress(&envelope.id, 85).await;

        let fields = json!({
            "job_id": envelope.id,
            "user_id": payload.user_id,
            "label": classification.label,
            "scientific_label": classification.scientific_label,
            "description": classification.description,
            "confidence": classification.confidence,
            "extra": classification.extra,
            "image_url": image_url,
        });
        let record_id = self.records.insert(RECORDS_COLLECTION, fields.clone()).await?;

        let mut result = fields;
        result["record_id"] = json!(record_id);
        Ok(result)
    }

    /// Progress updates are best-effort notifications and never fail the
    /// pipeline.
    async fn report_progress(&self, job_id: &str, progress: u8) {
        if let Err(e) = self.broker.update_progress(job_id, progress).await {
            tracing::warn!(job_id = %job_id, progress, error = %e, "Progress update dropped");
        }
    }
}
