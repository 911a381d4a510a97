use crate::config::DatabaseConfig;
use crate::outcome::DeleteOutcome;
use crate::record::{CatalogRecord, InconsistentRecord, RecordDocument, RecordStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DocumentStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("failed to encode record: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Corrupt(#[from] InconsistentRecord),
}

/// Source of truth for catalog records.
///
/// Expired `error` records are invisible to every read.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Write a terminal record unless a live record with the same id exists.
    /// Returns `false` when another writer got there first. Expired records
    /// are replaced.
    async fn create(&self, record: &CatalogRecord) -> Result<bool, DocumentStoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<CatalogRecord>, DocumentStoreError>;

    async fn delete(&self, id: Uuid) -> Result<DeleteOutcome, DocumentStoreError>;

    /// Most recent record of `owner` whose image locator contains `fragment`
    async fn find_by_owner_and_image(
        &self,
        owner: &str,
        fragment: &str,
    ) -> Result<Option<CatalogRecord>, DocumentStoreError>;

    /// Remove expired records, returning how many were dropped
    async fn purge_expired(&self) -> Result<u64, DocumentStoreError>;

    async fn ping(&self) -> Result<(), DocumentStoreError>;
}

#[derive(Debug, FromRow)]
struct RecordRow {
    id: Uuid,
    user_id: Option<String>,
    original_image_url: String,
    status: String,
    ai_analysis: Option<serde_json::Value>,
    metadata: Option<serde_json::Value>,
    upload_timestamp: DateTime<Utc>,
    ttl: Option<i32>,
}

impl TryFrom<RecordRow> for CatalogRecord {
    type Error = DocumentStoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let status = RecordStatus::parse(&row.status).ok_or(InconsistentRecord {
            id: row.id,
            reason: "unknown status",
        })?;
        let metadata = row.metadata.map(serde_json::from_value).transpose()?;
        let ttl = row
            .ttl
            .map(|ttl| {
                u32::try_from(ttl).map_err(|_| InconsistentRecord {
                    id: row.id,
                    reason: "negative ttl",
                })
            })
            .transpose()?;

        let document = RecordDocument {
            id: row.id,
            user_id: row.user_id,
            original_image_url: row.original_image_url,
            ai_analysis: row.ai_analysis,
            status,
            upload_timestamp: row.upload_timestamp,
            metadata,
            ttl,
        };

        Ok(CatalogRecord::try_from(document)?)
    }
}

/// The `ttl` column is a Postgres `INTEGER`
fn ttl_column(record: &CatalogRecord) -> Result<Option<i32>, InconsistentRecord> {
    record
        .ttl_secs()
        .map(|ttl| {
            i32::try_from(ttl).map_err(|_| InconsistentRecord {
                id: record.id,
                reason: "ttl out of range",
            })
        })
        .transpose()
}

/// PostgreSQL-backed document store
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    /// Create a new document store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DocumentStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), DocumentStoreError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    #[instrument(skip(self, record), fields(record_id = %record.id, status = %record.status()))]
    async fn create(&self, record: &CatalogRecord) -> Result<bool, DocumentStoreError> {
        let metadata = record.metadata().map(serde_json::to_value).transpose()?;
        let ttl = ttl_column(record)?;

        let result = sqlx::query(
            r#"
            INSERT INTO catalog_records (
                id, user_id, original_image_url, status, ai_analysis,
                metadata, upload_timestamp, ttl, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                original_image_url = EXCLUDED.original_image_url,
                status = EXCLUDED.status,
                ai_analysis = EXCLUDED.ai_analysis,
                metadata = EXCLUDED.metadata,
                upload_timestamp = EXCLUDED.upload_timestamp,
                ttl = EXCLUDED.ttl,
                expires_at = EXCLUDED.expires_at
            WHERE catalog_records.expires_at IS NOT NULL
              AND catalog_records.expires_at <= now()
            "#,
        )
        .bind(record.id)
        .bind(&record.user_id)
        .bind(&record.original_image_url)
        .bind(record.status().as_str())
        .bind(&record.ai_analysis)
        .bind(metadata)
        .bind(record.upload_timestamp)
        .bind(ttl)
        .bind(record.expires_at())
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() > 0;
        if created {
            debug!("Record stored");
        } else {
            debug!("Record already present, nothing written");
        }
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> Result<Option<CatalogRecord>, DocumentStoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT id, user_id, original_image_url, status, ai_analysis,
                   metadata, upload_timestamp, ttl
            FROM catalog_records
            WHERE id = $1
              AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CatalogRecord::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<DeleteOutcome, DocumentStoreError> {
        let result = sqlx::query("DELETE FROM catalog_records WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(if result.rows_affected() == 0 {
            DeleteOutcome::NotFound
        } else {
            DeleteOutcome::Deleted
        })
    }

    async fn find_by_owner_and_image(
        &self,
        owner: &str,
        fragment: &str,
    ) -> Result<Option<CatalogRecord>, DocumentStoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT id, user_id, original_image_url, status, ai_analysis,
                   metadata, upload_timestamp, ttl
            FROM catalog_records
            WHERE user_id = $1
              AND strpos(original_image_url, $2) > 0
              AND (expires_at IS NULL OR expires_at > now())
            ORDER BY upload_timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(owner)
        .bind(fragment)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CatalogRecord::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn purge_expired(&self) -> Result<u64, DocumentStoreError> {
        let result = sqlx::query("DELETE FROM catalog_records WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), DocumentStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
