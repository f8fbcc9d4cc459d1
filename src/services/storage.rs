use s3::creds::Credentials;
use s3::{Bucket, Region};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

/// External object storage for submitted images.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Persist `bytes` under `destination_path` and return the public URL.
    async fn store(
        &self,
        bytes: &[u8],
        destination_path: &str,
        content_type: &str,
    ) -> Result<String, StorageError>;
}

/// Cloudflare R2 object storage (S3-compatible).
pub struct R2Store {
    bucket: Box<Bucket>,
    public_base_url: String,
}

impl R2Store {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        public_base_url: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            bucket,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ObjectStore for R2Store {
    async fn store(
        &self,
        bytes: &[u8],
        destination_path: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.bucket
            .put_object_with_content_type(destination_path, bytes, content_type)
            .await
            .map_err(StorageError::S3)?;
        Ok(format!("{}/{}", self.public_base_url, destination_path))
    }
}
