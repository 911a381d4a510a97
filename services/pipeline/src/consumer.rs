//! Kafka consumer wrapper for the ComicVault pipeline.
//!
//! Delivery is at-least-once: a message is offered to its [`MessageHandler`]
//! until the handler succeeds or the [`RedeliveryPolicy`] is exhausted, in
//! which case it is published to the dead letter queue. The offset is
//! committed only after one of those two outcomes.

use crate::config::KafkaConfig;
use crate::producer::PipelineProducer;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Message processing error: {0}")]
    ProcessingError(String),
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Topic the message was received from
    pub topic: String,
    /// Partition the message was received from
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if present)
    pub key: Option<Vec<u8>>,
    /// Timestamp of the message
    pub timestamp: Option<i64>,
    /// Message headers
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Raw message payload
    pub payload: Vec<u8>,
    /// Message metadata
    pub metadata: MessageMetadata,
}

/// Handler trait for processing messages.
///
/// Returning `Ok` marks the message as delivered. Returning `Err` makes it
/// eligible for redelivery, so handlers must be safe to run more than once
/// for the same message.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: &IncomingMessage) -> Result<(), ConsumerError>;

    /// Called once a message has exhausted its delivery attempts
    async fn on_poison(&self, message: &IncomingMessage, error: &ConsumerError) {
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            error = %error,
            "Message exhausted its delivery attempts"
        );
    }
}

/// How many times a message is offered to its handler, and how long to
/// wait between two offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Result of offering one message to a handler
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// The handler accepted the message
    Handled { attempts: u32 },
    /// Every attempt failed; the message is poison
    Exhausted {
        attempts: u32,
        last_error: ConsumerError,
    },
}

impl DeliveryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Handled { attempts } => *attempts,
            DeliveryOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Offer a message to `handler` until it succeeds or `policy` runs out.
pub async fn deliver<H>(
    handler: &H,
    message: &IncomingMessage,
    policy: &RedeliveryPolicy,
) -> DeliveryOutcome
where
    H: MessageHandler + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match handler.handle(message).await {
            Ok(()) => return DeliveryOutcome::Handled { attempts: attempt },
            Err(e) if attempt >= max_attempts => {
                return DeliveryOutcome::Exhausted {
                    attempts: attempt,
                    last_error: e,
                };
            }
            Err(e) => {
                warn!(
                    topic = %message.metadata.topic,
                    offset = message.metadata.offset,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %e,
                    "Message processing failed, redelivering"
                );
                metrics::counter!("pipeline.messages.redelivered").increment(1);
                tokio::time::sleep(policy.backoff).await;
            }
        }
    }
}

/// High-level Kafka consumer wrapper
pub struct PipelineConsumer {
    consumer: StreamConsumer,
    policy: RedeliveryPolicy,
    shutdown_tx: watch::Sender<bool>,
    dlq_producer: Option<Arc<PipelineProducer>>,
}

impl PipelineConsumer {
    /// Create a new consumer with the given configuration
    pub fn new(config: &KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            brokers = %config.bootstrap_servers,
            group = %config.consumer.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            consumer,
            policy: config.redelivery_policy(),
            shutdown_tx,
            dlq_producer: None,
        })
    }

    /// Set the dead letter queue producer
    pub fn with_dlq_producer(mut self, producer: Arc<PipelineProducer>) -> Self {
        self.dlq_producer = Some(producer);
        self
    }

    /// Subscribe to the specified topics
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ConsumerError> {
        info!(topics = ?topics, "Subscribing to topics");
        self.consumer
            .subscribe(topics)
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))
    }

    /// Commit the current offsets synchronously
    pub fn commit(&self) -> Result<(), ConsumerError> {
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .map_err(|e| ConsumerError::CommitError(e.to_string()))
    }

    /// Signal shutdown to stop consuming
    pub fn shutdown(&self) {
        info!("Signaling consumer shutdown");
        self.shutdown_tx.send_replace(true);
    }

    /// Start consuming messages and process them with the given handler
    #[instrument(skip(self, handler))]
    pub async fn run<H: MessageHandler>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        use tokio_stream::StreamExt;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting message consumption loop");

        loop {
            if *shutdown_rx.borrow() {
                info!("Received shutdown signal");
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    continue;
                }
                message_result = stream.next() => {
                    match message_result {
                        Some(Ok(borrowed_message)) => {
                            let incoming = convert_message(&borrowed_message);

                            debug!(
                                topic = %incoming.metadata.topic,
                                partition = incoming.metadata.partition,
                                offset = incoming.metadata.offset,
                                "Received message"
                            );

                            match deliver(handler.as_ref(), &incoming, &self.policy).await {
                                DeliveryOutcome::Handled { attempts } => {
                                    metrics::counter!("pipeline.messages.handled").increment(1);
                                    debug!(attempts = attempts, "Message handled");
                                }
                                DeliveryOutcome::Exhausted { attempts, last_error } => {
                                    error!(
                                        topic = %incoming.metadata.topic,
                                        offset = incoming.metadata.offset,
                                        attempts = attempts,
                                        error = %last_error,
                                        "Message is poison, moving it to the dead letter queue"
                                    );
                                    handler.on_poison(&incoming, &last_error).await;
                                    self.dead_letter(&incoming, attempts, &last_error).await;
                                }
                            }

                            if let Err(e) = self
                                .consumer
                                .commit_message(&borrowed_message, CommitMode::Async)
                            {
                                warn!(error = %e, "Failed to commit offset");
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka error");
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.commit() {
            warn!(error = %e, "Failed to commit on shutdown");
        }

        Ok(())
    }

    async fn dead_letter(&self, message: &IncomingMessage, attempts: u32, error: &ConsumerError) {
        metrics::counter!("pipeline.messages.dead_lettered").increment(1);

        let Some(ref dlq) = self.dlq_producer else {
            warn!(
                topic = %message.metadata.topic,
                offset = message.metadata.offset,
                "No dead letter queue configured, dropping poison message"
            );
            return;
        };

        if let Err(dlq_err) = dlq
            .send_to_dlq(
                &message.metadata.topic,
                &message.payload,
                &error.to_string(),
                attempts,
            )
            .await
        {
            error!(error = %dlq_err, "Failed to send to DLQ");
        }
    }
}

/// Convert a borrowed Kafka message to our IncomingMessage type
fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg.key().map(|k| k.to_vec());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}

/// Builder for creating consumers with custom settings
pub struct ConsumerBuilder {
    config: KafkaConfig,
    dlq_producer: Option<Arc<PipelineProducer>>,
}

impl ConsumerBuilder {
    /// Create a new consumer builder from a base configuration
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            dlq_producer: None,
        }
    }

    /// Append a role to the consumer group ID, so each queue gets its own group
    pub fn group_suffix(mut self, suffix: &str) -> Self {
        self.config.consumer.group_id = format!("{}.{}", self.config.consumer.group_id, suffix);
        self
    }

    /// Override the redelivery budget
    pub fn max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.config.consumer.max_delivery_attempts = attempts;
        self
    }

    /// Set the dead letter queue producer
    pub fn with_dlq_producer(mut self, producer: Arc<PipelineProducer>) -> Self {
        self.dlq_producer = Some(producer);
        self
    }

    /// Build the consumer
    pub fn build(self) -> Result<PipelineConsumer, ConsumerError> {
        let mut consumer = PipelineConsumer::new(&self.config)?;
        if let Some(dlq) = self.dlq_producer {
            consumer = consumer.with_dlq_producer(dlq);
        }
        Ok(consumer)
    }
}

/// Async trait for message handlers (re-export for convenience)
pub use async_trait::async_trait;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn message(payload: &[u8]) -> IncomingMessage {
        IncomingMessage {
            payload: payload.to_vec(),
            metadata: MessageMetadata {
                topic: "comicvault.images.uploaded".to_string(),
                partition: 0,
                offset: 42,
                key: None,
                timestamp: None,
                headers: HashMap::new(),
            },
        }
    }

    /// Fails the first `failures` calls, then succeeds
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyHandler {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(&self, _message: &IncomingMessage) -> Result<(), ConsumerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(ConsumerError::ProcessingError(format!("attempt {call} failed")))
            } else {
                Ok(())
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_deliver_succeeds_first_time() {
        let handler = FlakyHandler::new(0);
        let outcome = deliver(&handler, &message(b"{}"), &fast_policy(3)).await;

        assert!(matches!(outcome, DeliveryOutcome::Handled { attempts: 1 }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deliver_redelivers_until_success() {
        let handler = FlakyHandler::new(2);
        let outcome = deliver(&handler, &message(b"{}"), &fast_policy(5)).await;

        assert!(matches!(outcome, DeliveryOutcome::Handled { attempts: 3 }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deliver_gives_up_after_max_attempts() {
        let handler = FlakyHandler::new(u32::MAX);
        let outcome = deliver(&handler, &message(b"{}"), &fast_policy(4)).await;

        match outcome {
            DeliveryOutcome::Exhausted { attempts, last_error } => {
                assert_eq!(attempts, 4);
                assert!(last_error.to_string().contains("attempt 4 failed"));
            }
            other => panic!("expected exhausted delivery, got {other:?}"),
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_deliver_treats_zero_attempts_as_one() {
        let handler = FlakyHandler::new(u32::MAX);
        let outcome = deliver(&handler, &message(b"{}"), &fast_policy(0)).await;

        assert_eq!(outcome.attempts(), 1);
    }

    #[test]
    fn test_builder_group_suffix() {
        let builder = ConsumerBuilder::new(KafkaConfig::default())
            .group_suffix("ingestion")
            .max_delivery_attempts(3);

        assert_eq!(builder.config.consumer.group_id, "comicvault-cataloger.ingestion");
        assert_eq!(builder.config.consumer.max_delivery_attempts, 3);
    }
}
