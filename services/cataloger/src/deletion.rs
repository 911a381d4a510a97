//! Deletion saga.
//!
//! Removes a record from the object store, the document store and the search
//! index, in that order. Every step is attempted regardless of the others and
//! no step failure is escalated: the saga only stops early when the request
//! itself is unusable or the requester does not own the record.

use crate::document_store::DocumentStore;
use crate::events::{parse_delete_requested, DeletionRequest};
use crate::locator::ImageLocator;
use crate::object_store::ObjectStore;
use crate::outcome::DeleteOutcome;
use crate::record::CatalogRecord;
use crate::search_index::SearchIndex;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Deleted,
    AlreadyAbsent,
    /// Nothing to delete in this store
    Skipped,
    Failed(String),
}

impl StepOutcome {
    fn from_result<E: fmt::Display>(store: &str, result: Result<DeleteOutcome, E>) -> Self {
        match result {
            Ok(DeleteOutcome::Deleted) => StepOutcome::Deleted,
            Ok(DeleteOutcome::NotFound) => {
                warn!(store = store, "Nothing to delete, already absent");
                StepOutcome::AlreadyAbsent
            }
            Err(e) => {
                warn!(store = store, error = %e, "Delete failed, continuing");
                StepOutcome::Failed(e.to_string())
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionReport {
    pub record_id: Uuid,
    pub object: StepOutcome,
    pub document: StepOutcome,
    pub index: StepOutcome,
}

impl DeletionReport {
    pub fn has_failures(&self) -> bool {
        self.object.is_failed() || self.document.is_failed() || self.index.is_failed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The event carried no usable record id
    InvalidRequest(String),
    /// The record belongs to someone other than the requester
    NotOwner { requested_by: String },
    /// The record could not be read, so ownership could not be checked
    OwnershipUnverified(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionResult {
    Completed(DeletionReport),
    Aborted(AbortReason),
}

pub struct DeletionSaga {
    objects: Arc<dyn ObjectStore>,
    documents: Arc<dyn DocumentStore>,
    index: Arc<dyn SearchIndex>,
}

impl DeletionSaga {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        documents: Arc<dyn DocumentStore>,
        index: Arc<dyn SearchIndex>,
    ) -> Self {
        Self {
            objects,
            documents,
            index,
        }
    }

    /// Run the saga for one raw event payload. Never fails.
    pub async fn handle_event(&self, payload: &[u8]) -> DeletionResult {
        match parse_delete_requested(payload) {
            Ok(request) => self.run(&request).await,
            Err(e) => {
                error!(error = %e, "Discarding malformed delete event");
                metrics::counter!("cataloger.events.discarded").increment(1);
                DeletionResult::Aborted(AbortReason::InvalidRequest(e.to_string()))
            }
        }
    }

    #[instrument(skip(self, request), fields(record_id = %request.record_id))]
    pub async fn run(&self, request: &DeletionRequest) -> DeletionResult {
        let record_id = request.record_id;

        let stored = match self.documents.get(record_id).await {
            Ok(stored) => stored,
            Err(e) => match request.requested_by {
                Some(_) => {
                    error!(error = %e, "Cannot read record to check ownership, aborting");
                    return DeletionResult::Aborted(AbortReason::OwnershipUnverified(
                        e.to_string(),
                    ));
                }
                None => {
                    warn!(error = %e, "Cannot read record, deleting with what the event carries");
                    None
                }
            },
        };

        if let (Some(requester), Some(record)) = (&request.requested_by, &stored) {
            if !record.is_visible_to(requester) {
                warn!(requested_by = %requester, owner = ?record.user_id, "Delete requested by a non-owner");
                return DeletionResult::Aborted(AbortReason::NotOwner {
                    requested_by: requester.clone(),
                });
            }
        }

        let image = image_to_delete(request, stored.as_ref());

        let object = match image {
            Some(ref image) => {
                StepOutcome::from_result("object", self.objects.delete(image).await)
            }
            None => {
                warn!("No image locator known for record, skipping object store");
                StepOutcome::Skipped
            }
        };
        let document =
            StepOutcome::from_result("document", self.documents.delete(record_id).await);
        let index = StepOutcome::from_result("index", self.index.delete(record_id).await);

        let report = DeletionReport {
            record_id,
            object,
            document,
            index,
        };

        if report.has_failures() {
            metrics::counter!("cataloger.cleanup.failures").increment(1);
            warn!(report = ?report, "Deletion finished with failures");
        } else {
            info!(report = ?report, "Deletion finished");
        }
        metrics::counter!("cataloger.deletions.completed").increment(1);

        DeletionResult::Completed(report)
    }
}

/// The stored record's locator wins over the one in the event
fn image_to_delete(
    request: &DeletionRequest,
    stored: Option<&CatalogRecord>,
) -> Option<ImageLocator> {
    stored
        .and_then(|record| match ImageLocator::parse(&record.original_image_url) {
            Ok(image) => Some(image),
            Err(e) => {
                warn!(error = %e, "Stored record has an unusable image locator");
                None
            }
        })
        .or_else(|| request.image.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ComicMetadata;
    use crate::search_index::SearchDocument;
    use crate::status::{StatusQueryService, StatusView};
    use crate::testing::Stores;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn image() -> ImageLocator {
        ImageLocator::parse("https://store/uploads/user42/abc.jpg").unwrap()
    }

    fn saga(stores: &Stores) -> DeletionSaga {
        DeletionSaga::new(
            stores.objects.clone(),
            stores.documents.clone(),
            stores.index.clone(),
        )
    }

    /// A processed record present in all three stores
    fn seed(stores: &Stores) -> CatalogRecord {
        let raw = json!({ "title": "Sandman #1" });
        let record =
            CatalogRecord::processed(&image(), raw.clone(), ComicMetadata::normalize(&raw), Utc::now());
        stores.objects.put(&image());
        stores.documents.insert(record.clone());
        stores
            .index
            .insert(SearchDocument::from_record(&record).unwrap());
        record
    }

    fn event(id: Uuid, blob_url: Option<&str>, user_id: Option<&str>) -> Vec<u8> {
        let mut event = json!({ "comic_id": id.to_string() });
        if let Some(url) = blob_url {
            event["blob_url"] = json!(url);
        }
        if let Some(user) = user_id {
            event["user_id"] = json!(user);
        }
        serde_json::to_vec(&event).unwrap()
    }

    fn completed(result: DeletionResult) -> DeletionReport {
        match result {
            DeletionResult::Completed(report) => report,
            other => panic!("expected a completed saga, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deletes_from_all_three_stores_in_order() {
        let stores = Stores::new();
        let record = seed(&stores);

        let report = completed(
            saga(&stores)
                .handle_event(&event(record.id, Some(image().as_str()), Some("user42")))
                .await,
        );

        assert_eq!(report.object, StepOutcome::Deleted);
        assert_eq!(report.document, StepOutcome::Deleted);
        assert_eq!(report.index, StepOutcome::Deleted);
        assert!(!stores.objects.contains(&image()));
        assert!(stores.documents.stored(record.id).is_none());
        assert!(stores.index.get(record.id).is_none());

        let journal = &stores.journal;
        let object = journal.position("object.delete").unwrap();
        let document = journal.position("document.delete").unwrap();
        let index = journal.position("index.delete").unwrap();
        assert!(object < document && document < index);
    }

    #[tokio::test]
    async fn test_missing_blob_url_uses_the_stored_locator() {
        let stores = Stores::new();
        let record = seed(&stores);

        let report = completed(saga(&stores).handle_event(&event(record.id, None, None)).await);

        assert_eq!(report.object, StepOutcome::Deleted);
        assert!(!stores.objects.contains(&image()));
    }

    #[tokio::test]
    async fn test_blob_already_removed_still_clears_the_other_stores() {
        let stores = Stores::new();
        let record = seed(&stores);
        stores.objects.delete(&image()).await.unwrap();

        let report = completed(
            saga(&stores)
                .handle_event(&event(record.id, Some(image().as_str()), None))
                .await,
        );

        assert_eq!(report.object, StepOutcome::AlreadyAbsent);
        assert_eq!(report.document, StepOutcome::Deleted);
        assert_eq!(report.index, StepOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_unknown_record_is_a_no_op() {
        let stores = Stores::new();
        let id = Uuid::new_v4();

        let report = completed(saga(&stores).handle_event(&event(id, None, None)).await);

        assert_eq!(
            report,
            DeletionReport {
                record_id: id,
                object: StepOutcome::Skipped,
                document: StepOutcome::AlreadyAbsent,
                index: StepOutcome::AlreadyAbsent,
            }
        );
    }

    #[tokio::test]
    async fn test_repeated_delete_is_a_no_op() {
        let stores = Stores::new();
        let record = seed(&stores);
        let saga = saga(&stores);
        let payload = event(record.id, Some(image().as_str()), None);

        completed(saga.handle_event(&payload).await);
        let second = completed(saga.handle_event(&payload).await);

        assert_eq!(second.object, StepOutcome::AlreadyAbsent);
        assert_eq!(second.document, StepOutcome::AlreadyAbsent);
        assert_eq!(second.index, StepOutcome::AlreadyAbsent);
    }

    #[tokio::test]
    async fn test_step_failures_do_not_stop_the_saga() {
        let stores = Stores::new();
        let record = seed(&stores);
        stores.objects.fail_deletes.store(true, Ordering::SeqCst);
        stores.documents.fail_deletes.store(true, Ordering::SeqCst);

        let report = completed(saga(&stores).handle_event(&event(record.id, None, None)).await);

        assert!(report.object.is_failed());
        assert!(report.document.is_failed());
        assert_eq!(report.index, StepOutcome::Deleted);
        assert!(report.has_failures());
    }

    #[tokio::test]
    async fn test_non_owner_cannot_delete() {
        let stores = Stores::new();
        let record = seed(&stores);

        let result = saga(&stores)
            .handle_event(&event(record.id, None, Some("intruder")))
            .await;

        assert_eq!(
            result,
            DeletionResult::Aborted(AbortReason::NotOwner {
                requested_by: "intruder".to_string()
            })
        );
        assert!(stores.documents.stored(record.id).is_some());
        assert!(stores.objects.contains(&image()));
        assert_eq!(stores.journal.count("index.delete"), 0);
    }

    #[tokio::test]
    async fn test_unowned_legacy_record_can_be_deleted_by_anyone() {
        let stores = Stores::new();
        let legacy = ImageLocator::parse("https://store/uploads/old.jpg").unwrap();
        let record = CatalogRecord::failed(&legacy, None, 3600, Utc::now());
        stores.documents.insert(record.clone());

        let report =
            completed(saga(&stores).handle_event(&event(record.id, None, Some("anyone"))).await);

        assert_eq!(report.document, StepOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_invalid_request_aborts_without_effect() {
        let stores = Stores::new();

        let result = saga(&stores).handle_event(br#"{"blob_url":"https://store/uploads/a.jpg"}"#).await;

        assert!(matches!(
            result,
            DeletionResult::Aborted(AbortReason::InvalidRequest(_))
        ));
        assert!(stores.journal.entries().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_record_reads_as_never_ingested() {
        let stores = Stores::new();
        let record = seed(&stores);
        let status = StatusQueryService::new(stores.documents.clone());

        assert!(matches!(
            status.query("user42", "abc.jpg").await.unwrap(),
            StatusView::Completed { .. }
        ));

        completed(
            saga(&stores)
                .handle_event(&event(record.id, None, Some("user42")))
                .await,
        );

        assert_eq!(
            status.query("user42", "abc.jpg").await.unwrap(),
            StatusView::Pending
        );
    }

    #[tokio::test]
    async fn test_unreadable_record_aborts_owner_requests() {
        let stores = Stores::new();
        let record = seed(&stores);
        stores.documents.fail_reads.store(true, Ordering::SeqCst);

        let result = saga(&stores)
            .handle_event(&event(record.id, None, Some("user42")))
            .await;

        assert!(matches!(
            result,
            DeletionResult::Aborted(AbortReason::OwnershipUnverified(_))
        ));
        assert_eq!(stores.journal.count("object.delete"), 0);
        assert_eq!(stores.journal.count("document.delete"), 0);
    }
}
