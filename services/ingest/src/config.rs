//! Configuration for the ingest service.
//!
//! Layered the same way for every Linehaul service: built-in defaults, then
//! `config/ingest.*`, then `/etc/linehaul/ingest.*`, then `INGEST__*`
//! environment variables (e.g. `INGEST__CLASSIFIER__RESULT_BUCKET`).

use linehaul_pipeline::KafkaConfig;
use linehaul_storage::S3Config;
use serde::Deserialize;

/// Main configuration for the ingest service.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    /// Kafka connection; the Classifier consumes `topics.object_notifications`
    #[serde(default)]
    pub kafka: KafkaConfig,

    #[serde(default)]
    pub s3: S3Config,

    pub classifier: ClassifierConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Classifier configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Bucket receiving processed partitions and unprocessed artifacts
    pub result_bucket: String,
}

fn default_service_name() -> String {
    "linehaul-ingest".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_metrics_port() -> u16 {
    9090
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

impl IngestConfig {
    /// Load configuration from files and environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/ingest").required(false))
            .add_source(config::File::with_name("/etc/linehaul/ingest").required(false))
            .add_source(
                config::Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.classifier.result_bucket.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "classifier.result_bucket".to_string(),
            ));
        }

        if self.kafka.topics.object_notifications.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "kafka.topics.object_notifications".to_string(),
            ));
        }

        self.kafka
            .validate()
            .map_err(|e| ConfigValidationError::InvalidValue {
                field: "kafka".to_string(),
                message: e.to_string(),
            })
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
