//! Bucket-addressed object storage interface.
//!
//! Both pipeline stages talk to storage exclusively through [`ObjectStore`],
//! which keeps the Classifier and Loader independent of the concrete backend
//! and lets tests run against an in-memory implementation.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Upper bound on keys accepted by a single batched delete (S3 `DeleteObjects`).
pub const MAX_BATCH_DELETE_KEYS: usize = 1000;

/// Errors returned by object storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// The object does not exist (already consumed or deleted)
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// The backend rejected or failed the request
    #[error("Storage {operation} failed for {bucket}/{key}: {message}")]
    Request {
        operation: &'static str,
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Batched delete of {count} keys exceeds the limit of {max}")]
    TooManyKeys { count: usize, max: usize },

    #[error("Invalid storage URI: {0}")]
    InvalidUri(String),
}

impl StorageError {
    pub fn request(
        operation: &'static str,
        bucket: &str,
        key: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::Request {
            operation,
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Whether this error means the object is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// A listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub bucket: String,
    pub key: String,
    pub size: u64,
}

impl ObjectMeta {
    /// Storage URI addressing this object, as handed to load jobs
    pub fn uri(&self) -> String {
        crate::layout::storage_uri(&self.bucket, &self.key)
    }
}

/// Result of a batched delete. Keys that failed are reported individually so
/// callers can retry exactly those.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchDeleteOutcome {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchDeleteOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_keys(&self) -> Vec<String> {
        self.failed.iter().map(|(key, _)| key.clone()).collect()
    }
}

/// Object storage client used by both pipeline stages
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object's bytes, or `None` if it does not exist
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>, StorageError>;

    /// List up to `max_results` objects under `prefix`, in key order.
    /// Listings are eventually consistent.
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        max_results: usize,
    ) -> Result<Vec<ObjectMeta>, StorageError>;

    /// Upload an object, replacing any existing one. Returns only once the
    /// backend has acknowledged the write.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Delete an object. Backends that can tell an object was already absent
    /// return [`StorageError::NotFound`].
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// Delete up to [`MAX_BATCH_DELETE_KEYS`] objects in one request.
    /// Absent keys count as deleted.
    async fn delete_batch(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> Result<BatchDeleteOutcome, StorageError>;
}
