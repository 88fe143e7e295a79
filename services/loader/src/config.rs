//! Configuration for the loader service.
//!
//! Sources, later overriding earlier: built-in defaults, `config/loader.*`,
//! `/etc/linehaul/loader.*`, then `LOADER__*` environment variables, e.g.
//! `LOADER__WAREHOUSE__DATASETS="pypi other-project.pypi_mirror"`.

use crate::warehouse::{DatasetRef, WarehouseError};
use linehaul_pipeline::KafkaConfig;
use linehaul_storage::{EventKind, S3Config, MAX_BATCH_DELETE_KEYS};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration for the loader service
#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka connection; triggers arrive on and continuations go to `topics.load_triggers`
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub s3: S3Config,
    pub warehouse: WarehouseConfig,
    pub loader: LoadConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Warehouse destinations and connections
#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseConfig {
    /// Project assumed for datasets given without one
    #[serde(default = "default_project")]
    pub default_project: String,
    /// Destination datasets, each `dataset` or `project.dataset`. Accepts a
    /// whitespace-separated string or a list.
    #[serde(deserialize_with = "deserialize_datasets")]
    pub datasets: Vec<String>,
    pub simple_table: String,
    pub download_table: String,
    /// PostgreSQL URL for the default project
    pub url: String,
    /// PostgreSQL URLs for other projects
    #[serde(default)]
    pub project_urls: HashMap<String, String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

/// Load orchestration settings
#[derive(Debug, Clone, Deserialize)]
pub struct LoadConfig {
    /// Bucket holding processed partitions
    pub result_bucket: String,
    /// Cap on partitions discovered (and therefore deleted) per kind per run
    #[serde(default = "default_max_objects_per_call")]
    pub max_objects_per_call: usize,
    #[serde(default)]
    pub delete_retry: RetryConfig,
}

/// Exponential backoff bounds for cleanup deletes
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
}

fn default_service_name() -> String {
    "linehaul-loader".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_project() -> String {
    "the-psf".to_string()
}
fn default_max_connections() -> u32 {
    5
}
fn default_acquire_timeout() -> u64 {
    30
}
fn default_max_objects_per_call() -> usize {
    MAX_BATCH_DELETE_KEYS
}
fn default_initial_interval_ms() -> u64 {
    200
}
fn default_max_interval_ms() -> u64 {
    5_000
}
fn default_max_elapsed_ms() -> u64 {
    60_000
}

fn deserialize_datasets<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Datasets {
        Joined(String),
        List(Vec<String>),
    }

    let datasets = match Datasets::deserialize(deserializer)? {
        Datasets::Joined(joined) => joined.split_whitespace().map(str::to_string).collect(),
        Datasets::List(list) => list
            .iter()
            .flat_map(|entry| entry.split_whitespace())
            .map(str::to_string)
            .collect(),
    };
    Ok(datasets)
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

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            max_elapsed_ms: default_max_elapsed_ms(),
        }
    }
}

impl RetryConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }
}

impl WarehouseConfig {
    pub fn dataset_refs(&self) -> Result<Vec<DatasetRef>, WarehouseError> {
        self.datasets
            .iter()
            .map(|dataset| DatasetRef::parse(dataset, &self.default_project))
            .collect()
    }

    /// Destination table for a kind
    pub fn table_for(&self, kind: EventKind) -> &str {
        match kind {
            EventKind::SimpleRequest => &self.simple_table,
            EventKind::Download => &self.download_table,
        }
    }

    /// Connection URL for the project owning a dataset
    pub fn connection_url(&self, project: &str) -> Option<&str> {
        if project == self.default_project {
            Some(self.url.as_str()).filter(|url| !url.is_empty())
        } else {
            self.project_urls.get(project).map(String::as_str)
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl LoaderConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/loader").required(false))
            .add_source(config::File::with_name("/etc/linehaul/loader").required(false))
            .add_source(
                config::Environment::with_prefix("LOADER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.loader.result_bucket.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "loader.result_bucket".to_string(),
            ));
        }

        if self.loader.max_objects_per_call == 0
            || self.loader.max_objects_per_call > MAX_BATCH_DELETE_KEYS
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "loader.max_objects_per_call".to_string(),
                message: format!("must be between 1 and {MAX_BATCH_DELETE_KEYS}"),
            });
        }

        let warehouse = &self.warehouse;
        if warehouse.datasets.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "warehouse.datasets".to_string(),
            ));
        }
        for (field, table) in [
            ("warehouse.simple_table", &warehouse.simple_table),
            ("warehouse.download_table", &warehouse.download_table),
        ] {
            if table.trim().is_empty() {
                return Err(ConfigValidationError::MissingField(field.to_string()));
            }
        }

        let datasets = warehouse
            .dataset_refs()
            .map_err(|e| ConfigValidationError::InvalidValue {
                field: "warehouse.datasets".to_string(),
                message: e.to_string(),
            })?;
        for dataset in &datasets {
            for kind in EventKind::ALL {
                dataset.table(warehouse.table_for(kind)).map_err(|e| {
                    ConfigValidationError::InvalidValue {
                        field: "warehouse tables".to_string(),
                        message: e.to_string(),
                    }
                })?;
            }
            if warehouse.connection_url(&dataset.project).is_none() {
                return Err(ConfigValidationError::InvalidValue {
                    field: "warehouse.project_urls".to_string(),
                    message: format!("no connection URL for project {}", dataset.project),
                });
            }
        }

        self.kafka
            .validate()
            .map_err(|e| ConfigValidationError::InvalidValue {
                field: "kafka".to_string(),
                message: e.to_string(),
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> config::ConfigBuilder<config::builder::DefaultState> {
        config::Config::builder()
            .set_override("warehouse.simple_table", "simple_requests")
            .unwrap()
            .set_override("warehouse.download_table", "file_downloads")
            .unwrap()
            .set_override("warehouse.url", "postgres://localhost/linehaul")
            .unwrap()
            .set_override("loader.result_bucket", "linehaul-results")
            .unwrap()
    }

    fn load(builder: config::ConfigBuilder<config::builder::DefaultState>) -> LoaderConfig {
        builder.build().unwrap().try_deserialize().unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = load(builder().set_override("warehouse.datasets", "pypi").unwrap());

        assert_eq!(config.warehouse.default_project, "the-psf");
        assert_eq!(config.loader.max_objects_per_call, 1000);
        assert_eq!(config.loader.delete_retry.initial_interval_ms, 200);
        assert_eq!(config.loader.delete_retry.max_elapsed(), Duration::from_secs(60));
        assert_eq!(config.kafka.topics.load_triggers, "linehaul.load-triggers");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_whitespace_separated_datasets() {
        let config = load(
            builder()
                .set_override("warehouse.datasets", "  pypi\tother-project.mirror ")
                .unwrap(),
        );
        assert_eq!(config.warehouse.datasets, vec!["pypi", "other-project.mirror"]);
    }

    #[test]
    fn test_dataset_list() {
        let config = load(
            builder()
                .set_override("warehouse.datasets", vec!["pypi", "mirror"])
                .unwrap(),
        );
        assert_eq!(config.warehouse.datasets, vec!["pypi", "mirror"]);
    }

    #[test]
    fn test_validate_rejects_oversized_listing() {
        let mut config = load(builder().set_override("warehouse.datasets", "pypi").unwrap());
        config.loader.max_objects_per_call = 1001;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { field, .. }) if field == "loader.max_objects_per_call"
        ));

        config.loader.max_objects_per_call = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_project_connection() {
        let mut config = load(
            builder()
                .set_override("warehouse.datasets", "pypi other-project.mirror")
                .unwrap(),
        );
        assert!(config.validate().is_err());

        config.warehouse.project_urls.insert(
            "other-project".to_string(),
            "postgres://other/linehaul".to_string(),
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_datasets() {
        let config = load(builder().set_override("warehouse.datasets", "   ").unwrap());
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(field)) if field == "warehouse.datasets"
        ));
    }

    #[test]
    fn test_table_for_kind() {
        let config = load(builder().set_override("warehouse.datasets", "pypi").unwrap());
        assert_eq!(config.warehouse.table_for(EventKind::Download), "file_downloads");
        assert_eq!(config.warehouse.table_for(EventKind::SimpleRequest), "simple_requests");
    }
}
