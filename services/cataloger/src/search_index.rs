use crate::config::SearchConfig;
use crate::outcome::DeleteOutcome;
use crate::record::{CatalogRecord, ComicMetadata, RecordStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SearchIndexError {
    #[error("search request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("search service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("search service rejected document {key}: {message}")]
    Rejected { key: String, message: String },

    #[error("invalid search response: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Searchable projection of a processed record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchDocument {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub original_image_url: String,
    pub status: RecordStatus,
    pub upload_timestamp: DateTime<Utc>,
    pub metadata: ComicMetadata,
}

impl SearchDocument {
    /// `None` for error records, which are never indexed
    pub fn from_record(record: &CatalogRecord) -> Option<Self> {
        let metadata = record.metadata()?.clone();
        Some(Self {
            id: record.id.to_string(),
            user_id: record.user_id.clone(),
            original_image_url: record.original_image_url.clone(),
            status: record.status(),
            upload_timestamp: record.upload_timestamp,
            metadata,
        })
    }
}

/// Full-text index over processed records
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert(&self, document: &SearchDocument) -> Result<(), SearchIndexError>;

    async fn delete(&self, id: Uuid) -> Result<DeleteOutcome, SearchIndexError>;
}

#[derive(Debug, Deserialize)]
struct IndexBatchResponse {
    value: Vec<IndexItemResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexItemResult {
    key: String,
    status: bool,
    error_message: Option<String>,
    status_code: u16,
}

fn index_batch(action: &str, document: Value) -> Value {
    let mut item = document;
    if let Value::Object(ref mut fields) = item {
        fields.insert("@search.action".to_string(), Value::String(action.to_string()));
    }
    json!({ "value": [item] })
}

/// Single-document outcome of an index batch
fn interpret_batch(body: &[u8]) -> Result<DeleteOutcome, SearchIndexError> {
    let response: IndexBatchResponse = serde_json::from_slice(body)?;
    let Some(item) = response.value.into_iter().next() else {
        return Err(SearchIndexError::Rejected {
            key: String::new(),
            message: "empty batch response".to_string(),
        });
    };

    match (item.status, item.status_code) {
        (_, 404) => Ok(DeleteOutcome::NotFound),
        (true, _) => Ok(DeleteOutcome::Deleted),
        (false, code) => Err(SearchIndexError::Rejected {
            key: item.key,
            message: item
                .error_message
                .unwrap_or_else(|| format!("status code {code}")),
        }),
    }
}

/// Azure AI Search REST client
pub struct HttpSearchIndex {
    http: reqwest::Client,
    url: Url,
    api_key: String,
}

impl HttpSearchIndex {
    pub fn new(config: &SearchConfig, timeout: Duration) -> anyhow::Result<Self> {
        let mut url = Url::parse(&config.endpoint)?
            .join(&format!("indexes/{}/docs/index", config.index_name))?;
        url.query_pairs_mut()
            .append_pair("api-version", &config.api_version);

        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            url,
            api_key: config.api_key.clone(),
        })
    }

    async fn send_batch(&self, batch: &Value) -> Result<DeleteOutcome, SearchIndexError> {
        let response = self
            .http
            .post(self.url.clone())
            .header("api-key", &self.api_key)
            .json(batch)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        // 207 carries per-document failures in the body
        if !status.is_success() && status.as_u16() != 207 {
            return Err(SearchIndexError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        interpret_batch(&body)
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    #[instrument(skip(self, document), fields(record_id = %document.id))]
    async fn upsert(&self, document: &SearchDocument) -> Result<(), SearchIndexError> {
        let batch = index_batch("mergeOrUpload", serde_json::to_value(document)?);
        self.send_batch(&batch).await?;
        debug!("Document indexed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<DeleteOutcome, SearchIndexError> {
        let batch = index_batch("delete", json!({ "id": id.to_string() }));
        self.send_batch(&batch).await
    }
}
