use sqlx::PgPool;
use std::sync::Arc;

use crate::queue::{Broker, Producer, StatusReader};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub broker: Arc<dyn Broker>,
    pub producer: Arc<Producer>,
    pub status: Arc<StatusReader>,
}

impl AppState {
    pub fn new(db: PgPool, broker: Arc<dyn Broker>) -> Self {
        let producer = Arc::new(Producer::new(broker.clone()));
        let status = Arc::new(StatusReader::new(broker.clone()));
        Self {
            db,
            broker,
            producer,
            status,
        }
    }
}
