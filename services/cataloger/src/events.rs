//! Decoding of the two inbound event payloads.
//!
//! Every failure here is malformed input: the caller logs it, discards the
//! event and acknowledges the message so it is never redelivered.

use crate::locator::{ImageLocator, LocatorError};
use comicvault_pipeline::{DeleteRequested, ImageUploaded};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("expected exactly one event in the batch, found {0}")]
    UnexpectedBatchSize(usize),

    #[error("event has no data.url")]
    MissingUrl,

    #[error("event carries an invalid image locator: {0}")]
    InvalidLocator(#[from] LocatorError),

    #[error("event has no comic_id")]
    MissingComicId,

    #[error("comic_id {0:?} is not a valid record id")]
    InvalidComicId(String),
}

/// Upload notifications arrive either bare or wrapped in a one-element array.
/// `Batch` is tried first: serde would otherwise read the array as a struct
/// in sequence form.
#[derive(Deserialize)]
#[serde(untagged)]
enum UploadPayload {
    Batch(Vec<ImageUploaded>),
    Single(ImageUploaded),
}

/// Extract the image locator from an "image uploaded" payload
pub fn parse_image_uploaded(payload: &[u8]) -> Result<ImageLocator, EventError> {
    let event = match serde_json::from_slice::<UploadPayload>(payload)? {
        UploadPayload::Single(event) => event,
        UploadPayload::Batch(mut events) => {
            if events.len() != 1 {
                return Err(EventError::UnexpectedBatchSize(events.len()));
            }
            events.remove(0)
        }
    };

    let url = event
        .data
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or(EventError::MissingUrl)?;

    Ok(ImageLocator::parse(&url)?)
}

/// Validated deletion request
#[derive(Debug, Clone, PartialEq)]
pub struct DeletionRequest {
    pub record_id: Uuid,
    pub image: Option<ImageLocator>,
    pub requested_by: Option<String>,
}

/// Decode a "delete requested" payload.
///
/// An unusable `blob_url` is dropped rather than rejected: the record id is
/// all the saga needs, and it can find the image through the stored record.
pub fn parse_delete_requested(payload: &[u8]) -> Result<DeletionRequest, EventError> {
    let event: DeleteRequested = serde_json::from_slice(payload)?;

    let comic_id = event
        .comic_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or(EventError::MissingComicId)?;
    let record_id =
        Uuid::parse_str(&comic_id).map_err(|_| EventError::InvalidComicId(comic_id.clone()))?;

    let image = event
        .blob_url
        .filter(|url| !url.trim().is_empty())
        .and_then(|url| match ImageLocator::parse(&url) {
            Ok(locator) => Some(locator),
            Err(e) => {
                tracing::warn!(
                    record_id = %record_id,
                    blob_url = %url,
                    error = %e,
                    "Ignoring unusable blob_url on delete request"
                );
                None
            }
        });

    Ok(DeletionRequest {
        record_id,
        image,
        requested_by: event.user_id.filter(|u| !u.is_empty()),
    })
}
