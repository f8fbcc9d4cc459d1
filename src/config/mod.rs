use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string (identification record store)
    pub database_url: String,

    /// Redis connection string for the job broker
    pub redis_url: String,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// Public base URL images are served from
    pub r2_public_url: String,

    /// Maximum concurrently active jobs per worker pool instance
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Claims granted per second across all pool instances
    #[serde(default = "default_claims_per_second")]
    pub claims_per_second: u64,

    /// Timeout on a single classification call, in seconds
    #[serde(default = "default_classify_timeout_secs")]
    pub classify_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_concurrency() -> usize {
    5
}

fn default_claims_per_second() -> u64 {
    10
}

fn default_classify_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
