use crate::document_store::{DocumentStore, DocumentStoreError};
use crate::record::{CatalogRecord, RecordOutcome};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Shown to the user when ingestion ends in an error record
pub const UNIDENTIFIED_MESSAGE: &str = "We could not identify this comic.";

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("image name fragment must not be empty")]
    EmptyFragment,

    #[error(transparent)]
    Store(#[from] DocumentStoreError),
}

/// What the frontend sees while polling an upload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusView {
    /// No record yet
    Pending,
    Error {
        message: String,
        comic: CatalogRecord,
    },
    Completed {
        comic: CatalogRecord,
    },
}

pub struct StatusQueryService {
    documents: Arc<dyn DocumentStore>,
}

impl StatusQueryService {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }

    /// Ingestion state of the upload of `owner` whose locator contains
    /// `fragment`. Expired error records read as pending.
    pub async fn query(&self, owner: &str, fragment: &str) -> Result<StatusView, StatusError> {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return Err(StatusError::EmptyFragment);
        }

        let record = self
            .documents
            .find_by_owner_and_image(owner, fragment)
            .await?;

        Ok(match record {
            None => StatusView::Pending,
            Some(record) => view_of(record),
        })
    }
}

fn view_of(record: CatalogRecord) -> StatusView {
    match record.outcome {
        RecordOutcome::Processed { .. } => StatusView::Completed { comic: record },
        RecordOutcome::Error { .. } => StatusView::Error {
            message: UNIDENTIFIED_MESSAGE.to_string(),
            comic: record,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::ImageLocator;
    use crate::record::ComicMetadata;
    use crate::testing::Stores;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn service(stores: &Stores) -> StatusQueryService {
        StatusQueryService::new(stores.documents.clone())
    }

    fn image() -> ImageLocator {
        ImageLocator::parse("https://store/uploads/user42/abc.jpg").unwrap()
    }

    #[tokio::test]
    async fn test_pending_when_no_record() {
        let stores = Stores::new();
        let view = service(&stores).query("user42", "user42/abc.jpg").await.unwrap();

        assert_eq!(view, StatusView::Pending);
        assert_eq!(serde_json::to_value(&view).unwrap(), json!({ "status": "pending" }));
    }

    #[tokio::test]
    async fn test_completed_carries_metadata() {
        let stores = Stores::new();
        let raw = json!({ "title": "Akira #1" });
        stores.documents.insert(CatalogRecord::processed(
            &image(),
            raw.clone(),
            ComicMetadata::normalize(&raw),
            Utc::now(),
        ));

        let view = service(&stores).query("user42", "abc.jpg").await.unwrap();
        let json = serde_json::to_value(&view).unwrap();

        assert_eq!(json["status"], "completed");
        assert_eq!(json["comic"]["metadata"]["title"], "Akira #1");
    }

    #[tokio::test]
    async fn test_error_carries_message_and_raw_payload() {
        let stores = Stores::new();
        let raw = json!({ "identified": false });
        stores
            .documents
            .insert(CatalogRecord::failed(&image(), Some(raw.clone()), 60, Utc::now()));

        let view = service(&stores).query("user42", "abc.jpg").await.unwrap();
        match view {
            StatusView::Error { message, comic } => {
                assert_eq!(message, UNIDENTIFIED_MESSAGE);
                assert_eq!(comic.ai_analysis, Some(raw));
            }
            other => panic!("expected error view, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_other_owners_records_are_invisible() {
        let stores = Stores::new();
        stores
            .documents
            .insert(CatalogRecord::failed(&image(), None, 60, Utc::now()));

        let view = service(&stores).query("user7", "abc.jpg").await.unwrap();
        assert_eq!(view, StatusView::Pending);
    }

    #[tokio::test]
    async fn test_expired_error_record_reads_as_pending() {
        let stores = Stores::new();
        stores.documents.insert(CatalogRecord::failed(
            &image(),
            None,
            60,
            Utc::now() - Duration::seconds(120),
        ));

        let view = service(&stores).query("user42", "abc.jpg").await.unwrap();
        assert_eq!(view, StatusView::Pending);
    }

    #[tokio::test]
    async fn test_empty_fragment_is_rejected() {
        let stores = Stores::new();
        let result = service(&stores).query("user42", "  ").await;
        assert!(matches!(result, Err(StatusError::EmptyFragment)));
    }
}
