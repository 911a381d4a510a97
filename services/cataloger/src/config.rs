use comicvault_pipeline::KafkaConfig;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the cataloger service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration shared with the pipeline crate
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Vision service configuration
    pub vision: VisionConfig,
    /// Search index configuration
    pub search: SearchConfig,
    /// Ingestion rules
    #[serde(default)]
    pub ingestion: IngestionConfig,
    /// Expired record cleanup
    #[serde(default)]
    pub retention: RetentionConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket receiving user uploads
    #[serde(default = "default_upload_bucket")]
    pub upload_bucket: String,
    /// Base URL that image locators are built from, e.g. `https://store`
    pub public_base_url: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Azure OpenAI vision deployment
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`
    pub endpoint: String,
    pub api_key: String,
    /// Deployment name of the vision-capable model
    pub deployment: String,
    #[serde(default = "default_vision_api_version")]
    pub api_version: String,
    /// Request timeout in seconds
    #[serde(default = "default_vision_timeout_secs")]
    pub timeout_secs: u64,
    /// Responses larger than this are treated as a failed analysis
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

/// Azure AI Search index
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Service endpoint, e.g. `https://my-search.search.windows.net`
    pub endpoint: String,
    /// Admin key
    pub api_key: String,
    #[serde(default = "default_index_name")]
    pub index_name: String,
    #[serde(default = "default_search_api_version")]
    pub api_version: String,
    /// Request timeout in seconds
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
}

/// Rules applied to every uploaded image
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    /// Containers the worker accepts images from
    #[serde(default = "default_allowed_containers")]
    pub allowed_containers: Vec<String>,
    /// Accepted file extensions, lowercase and without the dot
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Lifetime of error records in seconds
    #[serde(default = "default_error_ttl_secs")]
    pub error_ttl_secs: u32,
    /// Lifetime of the signed URL handed to the vision service
    #[serde(default = "default_signed_url_expiry_secs")]
    pub signed_url_expiry_secs: u64,
}

/// Background purge of expired error records
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Header carrying the authenticated user id
    #[serde(default = "default_owner_header")]
    pub owner_header: String,
    /// Largest accepted upload body
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "comicvault-cataloger".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_upload_bucket() -> String {
    "uploads".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_vision_api_version() -> String {
    "2024-02-15-preview".to_string()
}

fn default_vision_timeout_secs() -> u64 {
    60
}

fn default_max_response_bytes() -> usize {
    256 * 1024
}

fn default_max_tokens() -> u32 {
    500
}

fn default_temperature() -> f32 {
    0.1
}

fn default_index_name() -> String {
    "comics".to_string()
}

fn default_search_api_version() -> String {
    "2023-11-01".to_string()
}

fn default_search_timeout_secs() -> u64 {
    30
}

fn default_allowed_containers() -> Vec<String> {
    vec!["uploads".to_string()]
}

fn default_allowed_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "webp", "gif"]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

fn default_error_ttl_secs() -> u32 {
    60
}

fn default_signed_url_expiry_secs() -> u64 {
    15 * 60
}

fn default_purge_interval_secs() -> u64 {
    30
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_owner_header() -> String {
    "x-ms-client-principal-id".to_string()
}

fn default_max_upload_bytes() -> usize {
    5 * 1024 * 1024 // 5MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::with_defaults()?
            // Add config file if present
            .add_source(config::File::with_name("config/cataloger").required(false))
            .add_source(config::File::with_name("/etc/comicvault/cataloger").required(false))
            // Override with environment variables
            // CATALOGER__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("CATALOGER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    fn with_defaults(
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        config::Config::builder()
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("service.metrics_port", i64::from(default_metrics_port()))
    }

    pub fn vision_timeout(&self) -> Duration {
        Duration::from_secs(self.vision.timeout_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search.timeout_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.retention.purge_interval_secs)
    }
}

impl DatabaseConfig {
    /// Get pool acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle connection timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl IngestionConfig {
    pub fn signed_url_expiry(&self) -> Duration {
        Duration::from_secs(self.signed_url_expiry_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            allowed_containers: default_allowed_containers(),
            allowed_extensions: default_allowed_extensions(),
            error_ttl_secs: default_error_ttl_secs(),
            signed_url_expiry_secs: default_signed_url_expiry_secs(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            owner_header: default_owner_header(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}
