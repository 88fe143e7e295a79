//! Persisted artifact layout shared by the Classifier (writer) and the Loader
//! (reader).
//!
//! ```text
//! processed/<kind>/<YYYYMMDD>/<kind>-<source-id>.json   newline-delimited JSON
//! unprocessed/<YYYYMMDD>/<source-id>.txt                raw lines, verbatim
//! ```

use crate::object_store::StorageError;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Suffixes stripped from raw object names to form the source identifier
const SOURCE_SUFFIXES: &[&str] = &[".log.gz", ".gz", ".log"];

const PROCESSED_ROOT: &str = "processed";
const UNPROCESSED_ROOT: &str = "unprocessed";

/// Classification tag of a loadable event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Package-index page view
    #[serde(rename = "simple_requests")]
    SimpleRequest,
    /// Package file retrieval
    #[serde(rename = "file_downloads")]
    Download,
}

impl EventKind {
    /// All kinds, in the order the Loader processes them
    pub const ALL: [EventKind; 2] = [EventKind::Download, EventKind::SimpleRequest];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SimpleRequest => "simple_requests",
            EventKind::Download => "file_downloads",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// UTC calendar day used to bucket events and artifacts, rendered `YYYYMMDD`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionDay(NaiveDate);

impl PartitionDay {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// The day containing `timestamp`
    pub fn from_timestamp(timestamp: DateTime<Utc>) -> Self {
        Self(timestamp.date_naive())
    }

    pub fn today() -> Self {
        Self::from_timestamp(Utc::now())
    }

    /// The day before this one
    pub fn previous(&self) -> Self {
        Self(self.0 - Duration::days(1))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for PartitionDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%d"))
    }
}

/// Error parsing a partition day string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid partition day {0:?}, expected YYYYMMDD")]
pub struct InvalidPartitionDay(pub String);

impl FromStr for PartitionDay {
    type Err = InvalidPartitionDay;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != 8 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidPartitionDay(s.to_string()));
        }
        NaiveDate::parse_from_str(trimmed, "%Y%m%d")
            .map(Self)
            .map_err(|_| InvalidPartitionDay(s.to_string()))
    }
}

/// Derive the source identifier from a raw object name: the basename with its
/// known suffix removed.
pub fn source_identifier(object_name: &str) -> String {
    let basename = object_name.rsplit('/').next().unwrap_or(object_name);
    SOURCE_SUFFIXES
        .iter()
        .find_map(|suffix| basename.strip_suffix(suffix))
        .filter(|stem| !stem.is_empty())
        .unwrap_or(basename)
        .to_string()
}

/// Listing prefix for one kind's partitions on one day
pub fn processed_prefix(kind: EventKind, day: PartitionDay) -> String {
    format!("{PROCESSED_ROOT}/{kind}/{day}/")
}

/// Key of the partition holding `kind` records for `day` from one source object
pub fn processed_key(kind: EventKind, day: PartitionDay, source_id: &str) -> String {
    format!("{}{kind}-{source_id}.json", processed_prefix(kind, day))
}

/// Key of the unprocessed-lines artifact for one source object
pub fn unprocessed_key(day: PartitionDay, source_id: &str) -> String {
    format!("{UNPROCESSED_ROOT}/{day}/{source_id}.txt")
}

/// `s3://<bucket>/<key>`
pub fn storage_uri(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

/// Split a storage URI into (bucket, key)
pub fn parse_storage_uri(uri: &str) -> Result<(&str, &str), StorageError> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| StorageError::InvalidUri(uri.to_string()))?;

    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
        _ => Err(StorageError::InvalidUri(uri.to_string())),
    }
}
