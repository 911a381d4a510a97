//! ComicVault Cataloger
//!
//! Turns photographs of comic books into catalog records. Uploads are
//! identified by an external vision service and stored across three
//! independently failing stores; deletions are replayed across the same
//! three stores on a best-effort basis.
//!
//! ## Features
//!
//! - **Ingestion Worker**: validates each upload, asks the vision service to
//!   identify it and writes exactly one terminal record per image
//! - **Deletion Saga**: removes a record from object storage, the document
//!   store and the search index, tolerating partial failures
//! - **Status Queries**: lets the frontend poll an upload until its record
//!   appears
//! - **Retention**: purges short-lived error records once they expire
//!
//! ## Architecture
//!
//! ```text
//!  POST /api/v1/comics          Kafka                          Stores
//! ┌──────────────┐   ┌────────────────────────┐
//! │ HTTP API     │──▶│ comicvault.images.     │──┐     ┌──────────────┐
//! │              │   │   uploaded             │  ├────▶│ Ingestion    │
//! │              │   └────────────────────────┘  │     │ Worker       │──┐
//! │              │   ┌────────────────────────┐  │     └──────────────┘  │
//! │              │──▶│ comicvault.comics.     │──┘     ┌──────────────┐  │
//! └──────────────┘   │   delete-requested     │───────▶│ Deletion     │  │
//!        │           └────────────────────────┘        │ Saga         │  │
//!        │                                             └──────────────┘  │
//!        ▼                                                    │          ▼
//! ┌──────────────┐                                  ┌──────────────────────────┐
//! │ Status Query │◀─────────────────────────────────│ S3 │ PostgreSQL │ Search  │
//! └──────────────┘                                  └──────────────────────────┘
//! ```
//!
//! Every store sits behind a trait ([`ObjectStore`], [`DocumentStore`],
//! [`SearchIndex`], [`VisionClient`]) so the workers can be exercised against
//! in-memory stores.

pub mod api;
pub mod config;
pub mod deletion;
pub mod document_store;
pub mod events;
pub mod handlers;
pub mod ingestion;
pub mod locator;
pub mod object_store;
pub mod outcome;
pub mod record;
pub mod retention;
pub mod search_index;
pub mod status;
pub mod vision;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{create_router, start_api_server, AppState, EventPublisher};
pub use self::config::Config;
pub use deletion::{DeletionReport, DeletionResult, DeletionSaga, StepOutcome};
pub use document_store::{DocumentStore, DocumentStoreError, PgDocumentStore};
pub use handlers::{DeletionHandler, IngestionHandler};
pub use ingestion::{IngestError, IngestionOutcome, IngestionSettings, IngestionWorker};
pub use locator::ImageLocator;
pub use object_store::{ObjectStore, ObjectStoreError, S3ObjectStore};
pub use outcome::DeleteOutcome;
pub use record::{CatalogRecord, ComicMetadata, RecordOutcome, RecordStatus};
pub use search_index::{HttpSearchIndex, SearchDocument, SearchIndex};
pub use status::{StatusQueryService, StatusView};
pub use vision::{AzureOpenAiVisionClient, VisionClient, VisionOutcome};
