use crate::document_store::DocumentStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodically drops expired error records.
///
/// Reads already hide expired records, so a late or failed sweep only costs
/// storage.
pub async fn run_purge_loop(
    documents: Arc<dyn DocumentStore>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(interval_secs = interval.as_secs(), "Retention sweeper started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => purge_once(documents.as_ref()).await,
        }
    }

    info!("Retention sweeper stopped");
}

async fn purge_once(documents: &dyn DocumentStore) {
    match documents.purge_expired().await {
        Ok(0) => debug!("No expired records"),
        Ok(purged) => {
            metrics::counter!("cataloger.records.expired").increment(purged);
            info!(purged = purged, "Purged expired records");
        }
        Err(e) => warn!(error = %e, "Failed to purge expired records"),
    }
}
