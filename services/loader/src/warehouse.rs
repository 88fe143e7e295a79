//! Warehouse load-job interface.

use async_trait::async_trait;
use linehaul_storage::{EventKind, StorageError};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("Invalid dataset reference {0:?}")]
    InvalidDataset(String),

    #[error("Invalid table name {0:?}")]
    InvalidTable(String),

    #[error("No connection configured for project {0}")]
    UnknownProject(String),

    #[error("Failed to read load source {uri}: {source}")]
    Source {
        uri: String,
        #[source]
        source: StorageError,
    },

    #[error("Load source {0} no longer exists")]
    MissingSource(String),

    #[error("Malformed record at {uri}:{line}: {message}")]
    MalformedRecord {
        uri: String,
        line: usize,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Load job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },
}

/// A dataset, optionally qualified by the project that owns it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetRef {
    pub project: String,
    pub dataset: String,
}

impl DatasetRef {
    /// Parse `project.dataset` or a bare `dataset` in `default_project`
    pub fn parse(value: &str, default_project: &str) -> Result<Self, WarehouseError> {
        let value = value.trim();
        let (project, dataset) = match value.split_once('.') {
            Some((project, dataset)) => (project, dataset),
            None => (default_project, value),
        };

        if !is_valid_name(project, true) || !is_valid_name(dataset, false) {
            return Err(WarehouseError::InvalidDataset(value.to_string()));
        }

        Ok(Self {
            project: project.to_string(),
            dataset: dataset.to_string(),
        })
    }

    pub fn table(&self, table: &str) -> Result<TableRef, WarehouseError> {
        if !is_valid_name(table, false) {
            return Err(WarehouseError::InvalidTable(table.to_string()));
        }
        Ok(TableRef {
            dataset: self.clone(),
            table: table.to_string(),
        })
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.project, self.dataset)
    }
}

/// A destination table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub dataset: DatasetRef,
    pub table: String,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dataset, self.table)
    }
}

fn is_valid_name(name: &str, allow_dash: bool) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || (allow_dash && c == '-'))
}

/// One bulk load of newline-delimited JSON objects into one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadJob {
    pub job_id: String,
    pub kind: EventKind,
    pub source_uris: Vec<String>,
    pub destination: TableRef,
}

impl LoadJob {
    pub fn new(kind: EventKind, source_uris: Vec<String>, destination: TableRef) -> Self {
        Self {
            job_id: format!("linehaul_{}_{}", kind, Uuid::new_v4().simple()),
            kind,
            source_uris,
            destination,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub job_id: String,
    pub output_rows: u64,
}

/// Runs load jobs to completion.
///
/// A job either loads every record of every source or nothing; `load`
/// returns only once the outcome is durable. Fields in the records that the
/// destination does not model are ignored rather than rejected.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn load(&self, job: LoadJob) -> Result<LoadOutcome, WarehouseError>;
}
