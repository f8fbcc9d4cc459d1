use species_id::{
    config::AppConfig,
    db::{self, records::PgRecordStore},
    queue::{Broker, RedisBroker},
    services::{classifier::WorkersAiClassifier, storage::R2Store},
    worker::{LogObserver, WorkerPool, WorkerPoolConfig},
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting species identification worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let storage = R2Store::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
        &config.r2_public_url,
    )
    .expect("Failed to initialize R2 storage");

    let classify_timeout = Duration::from_secs(config.classify_timeout_secs);
    let classifier =
        WorkersAiClassifier::new(&config.cf_account_id, &config.cf_api_token, classify_timeout)
            .expect("Failed to initialize Workers AI classifier");

    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::new(&config.redis_url)
            .expect("Failed to initialize job broker")
            .with_claims_per_second(config.claims_per_second),
    );

    let pool_config = WorkerPoolConfig {
        concurrency: config.worker_concurrency,
        classify_timeout,
        ..WorkerPoolConfig::default()
    };

    let pool = WorkerPool::new(
        broker,
        Arc::new(classifier),
        Arc::new(storage),
        Arc::new(PgRecordStore::new(db_pool)),
        Arc::new(LogObserver),
        pool_config,
    );

    pool.run().await;
}
