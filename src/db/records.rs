use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Document-style store for persisted identification records. The worker
/// writes the final result here, outside the queue's own job state.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(
        &self,
        collection: &str,
        fields: serde_json::Value,
    ) -> Result<Uuid, RecordError>;

    async fn get(
        &self,
        collection: &str,
        id: Uuid,
    ) -> Result<Option<serde_json::Value>, RecordError>;
}

/// PostgreSQL-backed record store: one JSONB row per record, keyed by
/// collection name and id.
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RecordStore for PgRecordStore {
    async fn insert(
        &self,
        collection: &str,
        fields: serde_json::Value,
    ) -> Result<Uuid, RecordError> {
        let row = sqlx::query(
            r#"
            INSERT INTO records (collection, fields)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(collection)
        .bind(fields)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn get(
        &self,
        collection: &str,
        id: Uuid,
    ) -> Result<Option<serde_json::Value>, RecordError> {
        let row = sqlx::query(
            r#"
            SELECT fields
            FROM records
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(r) => Some(r.try_get("fields")?),
            None => None,
        })
    }
}
