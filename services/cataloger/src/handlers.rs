//! Bridges between the pipeline consumer and the cataloger workers.

use crate::deletion::{AbortReason, DeletionResult, DeletionSaga};
use crate::ingestion::IngestionWorker;
use comicvault_pipeline::{async_trait, ConsumerError, IncomingMessage, MessageHandler};
use std::sync::Arc;
use tracing::{debug, error};

/// Feeds "image uploaded" messages to the ingestion worker
pub struct IngestionHandler {
    worker: Arc<IngestionWorker>,
}

impl IngestionHandler {
    pub fn new(worker: Arc<IngestionWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl MessageHandler for IngestionHandler {
    async fn handle(&self, message: &IncomingMessage) -> Result<(), ConsumerError> {
        let outcome = self
            .worker
            .handle_event(&message.payload)
            .await
            .map_err(|e| ConsumerError::ProcessingError(e.to_string()))?;

        debug!(offset = message.metadata.offset, outcome = ?outcome, "Upload event handled");
        Ok(())
    }

    async fn on_poison(&self, message: &IncomingMessage, error: &ConsumerError) {
        error!(
            offset = message.metadata.offset,
            error = %error,
            "Upload event could not be catalogued, the image stays pending"
        );
    }
}

/// Feeds "delete requested" messages to the deletion saga
pub struct DeletionHandler {
    saga: Arc<DeletionSaga>,
}

impl DeletionHandler {
    pub fn new(saga: Arc<DeletionSaga>) -> Self {
        Self { saga }
    }
}

#[async_trait]
impl MessageHandler for DeletionHandler {
    /// Step failures are absorbed by the saga. Only an unverifiable ownership
    /// check is redelivered, since the saga had no effect at all.
    async fn handle(&self, message: &IncomingMessage) -> Result<(), ConsumerError> {
        match self.saga.handle_event(&message.payload).await {
            DeletionResult::Completed(report) => {
                debug!(offset = message.metadata.offset, report = ?report, "Delete event handled");
                Ok(())
            }
            DeletionResult::Aborted(AbortReason::OwnershipUnverified(reason)) => {
                Err(ConsumerError::ProcessingError(format!(
                    "ownership could not be verified: {reason}"
                )))
            }
            DeletionResult::Aborted(reason) => {
                debug!(offset = message.metadata.offset, reason = ?reason, "Delete event aborted");
                Ok(())
            }
        }
    }

    async fn on_poison(&self, message: &IncomingMessage, error: &ConsumerError) {
        error!(
            offset = message.metadata.offset,
            error = %error,
            "Delete event could not be applied, the record is left in place"
        );
    }
}
