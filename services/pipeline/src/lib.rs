//! ComicVault Pipeline - Kafka message pipeline for comic cataloguing
//!
//! This library is the message-delivery layer shared by the ComicVault
//! services. It handles:
//!
//! - "Image uploaded" events that start an ingestion
//! - "Delete requested" events that start a deletion saga
//! - At-least-once redelivery and the dead letter queue for poison messages
//!
//! # Example
//!
//! ```rust,no_run
//! use comicvault_pipeline::{ConsumerBuilder, KafkaConfig, PipelineProducer};
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::new("localhost:9092");
//!     let producer = Arc::new(PipelineProducer::new(config.clone())?);
//!
//!     let consumer = ConsumerBuilder::new(config.clone())
//!         .group_suffix("ingestion")
//!         .with_dlq_producer(producer)
//!         .build()?;
//!     consumer.subscribe(&[config.topics.image_uploaded.as_str()])?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod events;
pub mod producer;

// Re-export main types
pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, ReliabilityConfig, SaslConfig, SaslMechanism,
    SecurityProtocol, SslConfig, TopicConfig,
};
pub use consumer::{
    async_trait, deliver, ConsumerBuilder, ConsumerError, DeliveryOutcome, IncomingMessage,
    MessageHandler, MessageMetadata, PipelineConsumer, RedeliveryPolicy,
};
pub use events::{DeleteRequested, ImageUploaded, ImageUploadedData};
pub use producer::{DeliveryResult, OutgoingMessage, PipelineProducer, ProducerError};
