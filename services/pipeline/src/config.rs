//! Kafka configuration for the ComicVault pipeline.
//!
//! Connection, authentication, delivery and topic settings shared by the
//! producer and the consumer. The structures deserialize from any `config`
//! source, so services embed [`KafkaConfig`] directly in their own settings.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::consumer::RedeliveryPolicy;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SSL/TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SslConfig {
    /// Path to CA certificate file
    pub ca_location: Option<String>,
    /// Path to client certificate file
    pub certificate_location: Option<String>,
    /// Path to client private key file
    pub key_location: Option<String>,
}

/// SASL authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Producer reliability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Number of retries for failed sends
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Retry backoff in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Enable idempotent producer
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    /// Required acknowledgments: 0, 1, or all
    #[serde(default = "default_acks")]
    pub acks: String,
}

fn default_true() -> bool {
    true
}

fn default_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_acks() -> String {
    "all".to_string()
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            enable_idempotence: true,
            acks: default_acks(),
        }
    }
}

/// Consumer-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Maximum poll interval in milliseconds. A handler that runs longer
    /// than this loses its partitions and the message is delivered again.
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
    /// Handler invocations per message before it is dead-lettered
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    /// Pause between two deliveries of the same message
    #[serde(default = "default_redelivery_backoff_ms")]
    pub redelivery_backoff_ms: u64,
}

fn default_group_id() -> String {
    "comicvault-cataloger".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_heartbeat_interval() -> u64 {
    3000
}

fn default_max_poll_interval() -> u64 {
    300000
}

fn default_max_delivery_attempts() -> u32 {
    10
}

fn default_redelivery_backoff_ms() -> u64 {
    2000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_poll_interval_ms: default_max_poll_interval(),
            max_delivery_attempts: default_max_delivery_attempts(),
            redelivery_backoff_ms: default_redelivery_backoff_ms(),
        }
    }
}

/// Topic configuration for the ComicVault pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Topic carrying "image uploaded" events
    #[serde(default = "default_image_uploaded_topic")]
    pub image_uploaded: String,
    /// Topic carrying "delete requested" events
    #[serde(default = "default_delete_requested_topic")]
    pub delete_requested: String,
    /// Dead letter queue topic
    #[serde(default = "default_dlq_topic")]
    pub dead_letter_queue: String,
}

fn default_image_uploaded_topic() -> String {
    "comicvault.images.uploaded".to_string()
}

fn default_delete_requested_topic() -> String {
    "comicvault.comics.delete-requested".to_string()
}

fn default_dlq_topic() -> String {
    "comicvault.dlq".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            image_uploaded: default_image_uploaded_topic(),
            delete_requested: default_delete_requested_topic(),
            dead_letter_queue: default_dlq_topic(),
        }
    }
}

/// Main Kafka configuration for the ComicVault pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Security protocol
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    /// SSL configuration
    #[serde(default)]
    pub ssl: SslConfig,
    /// SASL configuration
    #[serde(default)]
    pub sasl: SaslConfig,
    /// Reliability settings
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    /// Consumer settings
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Topic configuration
    #[serde(default)]
    pub topics: TopicConfig,
    /// Additional Kafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "comicvault".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
            reliability: ReliabilityConfig::default(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    /// Create a new KafkaConfig with the specified bootstrap servers
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Build a base rdkafka ClientConfig from this configuration
    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref cert) = self.ssl.certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(ref key) = self.ssl.key_location {
            config.set("ssl.key.location", key);
        }

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", self.sasl.mechanism.as_str());
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Build a producer ClientConfig
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("retries", self.reliability.retries.to_string());
        config.set("retry.backoff.ms", self.reliability.retry_backoff_ms.to_string());
        config.set("request.timeout.ms", self.reliability.request_timeout_ms.to_string());
        config.set("acks", &self.reliability.acks);

        if self.reliability.enable_idempotence {
            config.set("enable.idempotence", "true");
        }

        config
    }

    /// Build a consumer ClientConfig.
    ///
    /// Auto commit is always off: offsets are committed only once a message
    /// has been handled or dead-lettered.
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", &self.consumer.group_id);
        config.set("auto.offset.reset", &self.consumer.auto_offset_reset);
        config.set("enable.auto.commit", "false");
        config.set(
            "session.timeout.ms",
            self.consumer.session_timeout_ms.to_string(),
        );
        config.set(
            "heartbeat.interval.ms",
            self.consumer.heartbeat_interval_ms.to_string(),
        );
        config.set(
            "max.poll.interval.ms",
            self.consumer.max_poll_interval_ms.to_string(),
        );

        config
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.reliability.request_timeout_ms)
    }

    /// Redelivery policy applied by the consumer loop
    pub fn redelivery_policy(&self) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_attempts: self.consumer.max_delivery_attempts,
            backoff: Duration::from_millis(self.consumer.redelivery_backoff_ms),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired(
                "bootstrap_servers".to_string(),
            ));
        }

        if self.consumer.group_id.is_empty() {
            return Err(ConfigError::MissingRequired(
                "consumer.group_id".to_string(),
            ));
        }

        if self.consumer.max_delivery_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "consumer.max_delivery_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.security_protocol.uses_sasl() && self.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "sasl.username (required for SASL)".to_string(),
            ));
        }

        Ok(())
    }
}
