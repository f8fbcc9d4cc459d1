use std::sync::Arc;

use crate::models::job::JobStatusView;

use super::{Broker, BrokerError};

/// Read-only projection of envelope state for polling clients.
///
/// A job that never existed and one evicted by retention both read as
/// `None`; they are indistinguishable by design. Reads never mutate envelope
/// state or consume a retry attempt.
pub struct StatusReader {
    broker: Arc<dyn Broker>,
}

impl StatusReader {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub async fn get_status(&self, job_id: &str) -> Result<Option<JobStatusView>, BrokerError> {
        let envelope = self.broker.fetch(job_id).await?;
        Ok(envelope.as_ref().map(JobStatusView::from))
    }
}
