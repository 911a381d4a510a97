//! Ingestion worker.
//!
//! Turns one "image uploaded" event into one terminal catalog record:
//!
//! ```text
//! received ──► validated ──► analyzed ──► processed
//!     │                          │
//!     └──── rejected ────────────┴──────► error (ttl, source image deleted)
//! ```
//!
//! The document store is always written before any other store is touched
//! and before the source image is deleted. Only document store failures
//! (and failing to sign the read URL, before any record exists) are returned
//! to the caller, which makes the event eligible for redelivery.

use crate::config::IngestionConfig;
use crate::document_store::{DocumentStore, DocumentStoreError};
use crate::events::parse_image_uploaded;
use crate::locator::ImageLocator;
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::outcome::DeleteOutcome;
use crate::record::{CatalogRecord, ComicMetadata, RecordOutcome, RecordStatus};
use crate::search_index::{SearchDocument, SearchIndex};
use crate::vision::{FailureKind, VisionClient, VisionOutcome};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("document store unavailable for record {record_id}: {source}")]
    DocumentStore {
        record_id: Uuid,
        #[source]
        source: DocumentStoreError,
    },

    #[error("could not sign a read URL for {image}: {source}")]
    SignedUrl {
        image: String,
        #[source]
        source: ObjectStoreError,
    },
}

/// Why an image never reached the vision service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    ContainerNotAllowed(String),
    ExtensionNotAllowed(Option<String>),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::ContainerNotAllowed(container) => {
                write!(f, "container {container:?} is not accepted")
            }
            Rejection::ExtensionNotAllowed(Some(ext)) => {
                write!(f, "file type {ext:?} is not accepted")
            }
            Rejection::ExtensionNotAllowed(None) => f.write_str("file has no extension"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestionOutcome {
    /// Malformed event, no record written
    Discarded,
    Processed { record_id: Uuid },
    /// Failed validation; error record written without calling the vision service
    Rejected { record_id: Uuid, reason: Rejection },
    /// Vision analysis failed; error record written
    Unidentified { record_id: Uuid, kind: FailureKind },
    /// A terminal record already existed; only its follow-up steps were replayed
    AlreadyCatalogued { record_id: Uuid, status: RecordStatus },
    /// A concurrent delivery wrote the record, which was removed before it
    /// could be read back
    Superseded { record_id: Uuid },
}

#[derive(Debug, Clone)]
pub struct IngestionSettings {
    pub allowed_containers: Vec<String>,
    pub allowed_extensions: Vec<String>,
    pub error_ttl_secs: u32,
    pub signed_url_expiry: Duration,
}

impl From<&IngestionConfig> for IngestionSettings {
    fn from(config: &IngestionConfig) -> Self {
        Self {
            allowed_containers: config.allowed_containers.clone(),
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            error_ttl_secs: config.error_ttl_secs,
            signed_url_expiry: config.signed_url_expiry(),
        }
    }
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self::from(&IngestionConfig::default())
    }
}

impl IngestionSettings {
    pub fn validate(&self, image: &ImageLocator) -> Result<(), Rejection> {
        if !self
            .allowed_containers
            .iter()
            .any(|c| c == image.container())
        {
            return Err(Rejection::ContainerNotAllowed(image.container().to_string()));
        }

        match image.extension() {
            Some(ext) if self.allowed_extensions.contains(&ext) => Ok(()),
            other => Err(Rejection::ExtensionNotAllowed(other)),
        }
    }
}

pub struct IngestionWorker {
    objects: Arc<dyn ObjectStore>,
    vision: Arc<dyn VisionClient>,
    documents: Arc<dyn DocumentStore>,
    index: Arc<dyn SearchIndex>,
    settings: IngestionSettings,
}

impl IngestionWorker {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        vision: Arc<dyn VisionClient>,
        documents: Arc<dyn DocumentStore>,
        index: Arc<dyn SearchIndex>,
        settings: IngestionSettings,
    ) -> Self {
        Self {
            objects,
            vision,
            documents,
            index,
            settings,
        }
    }

    /// Process one raw event payload
    pub async fn handle_event(&self, payload: &[u8]) -> Result<IngestionOutcome, IngestError> {
        let image = match parse_image_uploaded(payload) {
            Ok(image) => image,
            Err(e) => {
                error!(error = %e, "Discarding malformed upload event");
                metrics::counter!("cataloger.events.discarded").increment(1);
                return Ok(IngestionOutcome::Discarded);
            }
        };

        self.ingest(&image).await
    }

    #[instrument(skip(self, image), fields(record_id = %image.record_id(), image = %image))]
    pub async fn ingest(&self, image: &ImageLocator) -> Result<IngestionOutcome, IngestError> {
        let record_id = image.record_id();
        debug!("Upload event received");

        let existing = self
            .documents
            .get(record_id)
            .await
            .map_err(|source| IngestError::DocumentStore { record_id, source })?;
        if let Some(record) = existing {
            return Ok(self.replay(&record, image).await);
        }

        if let Err(reason) = self.settings.validate(image) {
            warn!(reason = %reason, "Rejecting upload");
            let record =
                CatalogRecord::failed(image, None, self.settings.error_ttl_secs, Utc::now());
            if !self.persist(&record).await? {
                return self.defer_to_existing(image).await;
            }
            self.delete_source(image).await;
            metrics::counter!("cataloger.records.failed").increment(1);
            return Ok(IngestionOutcome::Rejected { record_id, reason });
        }
        debug!("Upload validated");

        let read_url = self
            .objects
            .presigned_read_url(image, self.settings.signed_url_expiry)
            .await
            .map_err(|source| IngestError::SignedUrl {
                image: image.to_string(),
                source,
            })?;

        let started = Instant::now();
        let analysis = self.vision.analyze(&read_url).await;
        metrics::histogram!("cataloger.vision.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match analysis {
            VisionOutcome::Identified(raw) => {
                let metadata = ComicMetadata::normalize(&raw);
                let record = CatalogRecord::processed(image, raw, metadata, Utc::now());
                if !self.persist(&record).await? {
                    return self.defer_to_existing(image).await;
                }
                self.index_record(&record).await;

                metrics::counter!("cataloger.records.processed").increment(1);
                info!(title = ?record.metadata().map(|m| &m.title), "Comic catalogued");
                Ok(IngestionOutcome::Processed { record_id })
            }
            VisionOutcome::Failed(failure) => {
                warn!(failure = %failure, "Vision analysis failed");
                let record = CatalogRecord::failed(
                    image,
                    failure.raw,
                    self.settings.error_ttl_secs,
                    Utc::now(),
                );
                if !self.persist(&record).await? {
                    return self.defer_to_existing(image).await;
                }
                self.delete_source(image).await;

                metrics::counter!("cataloger.records.failed").increment(1);
                Ok(IngestionOutcome::Unidentified {
                    record_id,
                    kind: failure.kind,
                })
            }
        }
    }

    /// Redo the steps that follow the document write of an existing record
    async fn replay(&self, record: &CatalogRecord, image: &ImageLocator) -> IngestionOutcome {
        info!(status = %record.status(), "Record already exists, replaying follow-up steps");

        match record.outcome {
            RecordOutcome::Processed { .. } => self.index_record(record).await,
            RecordOutcome::Error { .. } => self.delete_source(image).await,
        }

        IngestionOutcome::AlreadyCatalogued {
            record_id: record.id,
            status: record.status(),
        }
    }

    /// Write the terminal record; `false` when a concurrent delivery wrote first
    async fn persist(&self, record: &CatalogRecord) -> Result<bool, IngestError> {
        self.documents
            .create(record)
            .await
            .map_err(|source| IngestError::DocumentStore {
                record_id: record.id,
                source,
            })
    }

    /// The first terminal record wins. The losing delivery drops its own
    /// outcome and replays the winner's follow-up steps.
    async fn defer_to_existing(&self, image: &ImageLocator) -> Result<IngestionOutcome, IngestError> {
        let record_id = image.record_id();
        info!("Record written by a concurrent delivery, deferring to it");

        let existing = self
            .documents
            .get(record_id)
            .await
            .map_err(|source| IngestError::DocumentStore { record_id, source })?;

        Ok(match existing {
            Some(record) => self.replay(&record, image).await,
            None => {
                warn!("Concurrently written record is already gone");
                IngestionOutcome::Superseded { record_id }
            }
        })
    }

    async fn index_record(&self, record: &CatalogRecord) {
        let Some(document) = SearchDocument::from_record(record) else {
            return;
        };

        if let Err(e) = self.index.upsert(&document).await {
            error!(error = %e, "Search index write failed, record stays in the document store");
            metrics::counter!("cataloger.index.write_failures").increment(1);
        }
    }

    async fn delete_source(&self, image: &ImageLocator) {
        match self.objects.delete(image).await {
            Ok(DeleteOutcome::Deleted) => debug!("Source image deleted"),
            Ok(DeleteOutcome::NotFound) => warn!("Source image already gone"),
            Err(e) => {
                warn!(error = %e, "Failed to delete source image");
                metrics::counter!("cataloger.cleanup.failures").increment(1);
            }
        }
    }
}
