//! Linehaul Storage
//!
//! Object storage access for the Linehaul access-log pipeline, plus the
//! persisted artifact layout both pipeline stages agree on.
//!
//! ## Layout
//!
//! ```text
//! Raw logs bucket             Result bucket
//! ┌──────────────┐           ┌──────────────────────────────┐
//! │ *.log.gz     │──ingest──▶│ processed/{kind}/{day}/*.json │──loader──▶ warehouse
//! └──────────────┘           │ unprocessed/{day}/*.txt       │
//!                            └──────────────────────────────┘
//! ```
//!
//! Every artifact name is derived deterministically from the raw object's
//! name, so re-processing a raw object overwrites rather than duplicates.

pub mod config;
pub mod layout;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod object_store;
pub mod s3;

pub use config::S3Config;
pub use layout::{EventKind, InvalidPartitionDay, PartitionDay};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::{InMemoryObjectStore, StoreCall};
pub use object_store::{
    BatchDeleteOutcome, ObjectMeta, ObjectStore, StorageError, MAX_BATCH_DELETE_KEYS,
};
pub use s3::S3ObjectStore;
