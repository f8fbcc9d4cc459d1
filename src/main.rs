mod app_state;
mod config;
mod db;
mod models;
mod queue;
mod routes;
mod services;
mod worker;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use queue::{Broker, RedisBroker};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing species-id server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("identify_jobs_enqueued", "Total identification jobs submitted");
    metrics::describe_counter!(
        "identify_jobs_completed",
        "Total identification jobs completed"
    );
    metrics::describe_counter!(
        "identify_jobs_retried",
        "Total identification attempts re-queued for retry"
    );
    metrics::describe_counter!(
        "identify_jobs_failed",
        "Total identification jobs that failed terminally"
    );
    metrics::describe_histogram!(
        "classification_seconds",
        "Time spent in the external classification call"
    );
    metrics::describe_gauge!(
        "identify_queue_depth",
        "Current number of waiting jobs in the queue"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize Redis job broker
    tracing::info!("Connecting to Redis job broker");
    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::new(&config.redis_url)
            .expect("Failed to initialize job broker")
            .with_claims_per_second(config.claims_per_second),
    );

    // Create shared application state
    let state = AppState::new(db_pool, broker);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/identify", post(routes::identify::submit_identification))
        .route(
            "/api/v1/identify/{job_id}",
            get(routes::identify::get_job_status),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024)); // 10 MB limit

    tracing::info!("Starting species-id on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
