//! Kafka producer wrapper for the ComicVault pipeline.
//!
//! Publishes the two cataloguing events and moves poison messages to the
//! dead letter queue.

use crate::config::KafkaConfig;
use crate::events::{DeleteRequested, ImageUploaded};
use base64::{engine::general_purpose::STANDARD, Engine};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Topic the message was delivered to
    pub topic: String,
    /// Partition the message was delivered to
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if provided)
    pub key: Option<String>,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Topic to send the message to
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
    /// Serialized message payload
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    /// Set the message key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Add a message type header
    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }

    fn kafka_headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            })
    }
}

/// Envelope published to the dead letter queue for a poison message
pub fn dead_letter_envelope(
    original_topic: &str,
    original_message: &[u8],
    error: &str,
    attempts: u32,
) -> serde_json::Value {
    serde_json::json!({
        "original_topic": original_topic,
        "original_message_base64": STANDARD.encode(original_message),
        "error": error,
        "attempts": attempts,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

/// High-level Kafka producer wrapper
pub struct PipelineProducer {
    producer: FutureProducer,
    config: Arc<KafkaConfig>,
    default_timeout: Duration,
}

impl PipelineProducer {
    /// Create a new producer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!(brokers = %config.bootstrap_servers, "Creating Kafka producer");

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let default_timeout = config.request_timeout();

        Ok(Self {
            producer,
            config: Arc::new(config),
            default_timeout,
        })
    }

    /// Send a message and wait for delivery confirmation
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        self.send_with_timeout(message, self.default_timeout).await
    }

    /// Send a message with a custom timeout
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send_with_timeout(
        &self,
        message: OutgoingMessage,
        timeout: Duration,
    ) -> Result<DeliveryResult, ProducerError> {
        let topic = message.topic.clone();
        let key = message.key.clone();

        let mut record = FutureRecord::to(&topic)
            .payload(&message.payload)
            .headers(message.kafka_headers());

        if let Some(ref k) = key {
            record = record.key(k);
        }

        debug!(
            size_bytes = message.payload.len(),
            "Sending message"
        );

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition = partition, offset = offset, "Message delivered");

        Ok(DeliveryResult {
            topic,
            partition,
            offset,
            key,
        })
    }

    /// Announce a freshly uploaded image to the ingestion worker
    pub async fn publish_image_uploaded(
        &self,
        url: impl Into<String>,
    ) -> Result<DeliveryResult, ProducerError> {
        let url = url.into();
        let message = OutgoingMessage::new_json(
            &self.config.topics.image_uploaded,
            &ImageUploaded::new(url.clone()),
        )?
        .with_key(url)
        .with_message_type("image_uploaded");

        self.send(message).await
    }

    /// Ask the deletion saga to remove a catalogued comic
    pub async fn publish_delete_requested(
        &self,
        request: &DeleteRequested,
    ) -> Result<DeliveryResult, ProducerError> {
        let mut message =
            OutgoingMessage::new_json(&self.config.topics.delete_requested, request)?
                .with_message_type("delete_requested");

        if let Some(ref comic_id) = request.comic_id {
            message = message.with_key(comic_id);
        }

        self.send(message).await
    }

    /// Send a message to the dead letter queue
    pub async fn send_to_dlq(
        &self,
        original_topic: &str,
        original_message: &[u8],
        error: &str,
        attempts: u32,
    ) -> Result<DeliveryResult, ProducerError> {
        let envelope = dead_letter_envelope(original_topic, original_message, error, attempts);

        let message = OutgoingMessage::new_json(&self.config.topics.dead_letter_queue, &envelope)?
            .with_key(Uuid::new_v4().to_string())
            .with_message_type("dead_letter")
            .with_header("original-topic", original_topic);

        self.send(message).await
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

impl Drop for PipelineProducer {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn test_outgoing_message_builder() {
        let message = assert_ok!(OutgoingMessage::new_json(
            "comicvault.images.uploaded",
            &ImageUploaded::new("https://store/uploads/u/a.png"),
        ))
        .with_key("my-key")
        .with_message_type("image_uploaded")
        .with_header("trace", "abc");

        assert_eq!(message.key, Some("my-key".to_string()));
        assert_eq!(message.headers.len(), 2);
        assert_eq!(
            message.headers[0],
            ("message-type".to_string(), "image_uploaded".to_string())
        );
    }

    #[test]
    fn test_dead_letter_envelope() {
        let envelope = dead_letter_envelope("comicvault.images.uploaded", b"Hello", "boom", 10);

        assert_eq!(envelope["original_topic"], "comicvault.images.uploaded");
        assert_eq!(envelope["original_message_base64"], "SGVsbG8=");
        assert_eq!(envelope["error"], "boom");
        assert_eq!(envelope["attempts"], 10);
        assert!(envelope["timestamp"].is_string());
    }
}
