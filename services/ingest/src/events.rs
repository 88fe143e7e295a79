//! Structured events produced from access-log lines and their JSON record form.

use chrono::{DateTime, Utc};
use linehaul_storage::{EventKind, PartitionDay};
use serde::{Deserialize, Serialize, Serializer};

/// Record timestamps are rendered with an explicit UTC offset so the warehouse
/// parses them without a session time zone.
const RECORD_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S +00:00";

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&ts.format(RECORD_TIMESTAMP_FORMAT))
}

/// A classified access-log line
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Simple(SimpleRequest),
    Download(Download),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Simple(_) => EventKind::SimpleRequest,
            Event::Download(_) => EventKind::Download,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::Simple(e) => e.timestamp,
            Event::Download(e) => e.timestamp,
        }
    }

    /// Day partition this event belongs to
    pub fn partition_day(&self) -> PartitionDay {
        PartitionDay::from_timestamp(self.timestamp())
    }

    /// One NDJSON record, without the trailing newline
    pub fn to_record(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Event::Simple(e) => serde_json::to_vec(e),
            Event::Download(e) => serde_json::to_vec(e),
        }
    }
}

/// A package-index page view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimpleRequest {
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cipher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Details>,
}

/// A package file retrieval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Download {
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub project: String,
    pub file: File,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cipher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Details>,
}

/// The distribution file a download retrieved
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct File {
    pub filename: String,
    pub project: String,
    pub version: String,
    #[serde(rename = "type")]
    pub package_type: String,
}

/// Client environment reported by the installer's user agent.
///
/// Unknown keys in the user-agent JSON are ignored; `ci` is always emitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Details {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installer: Option<Installer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation: Option<Implementation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distro: Option<Distro>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<System>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openssl_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setuptools_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rustc_version: Option<String>,
    pub ci: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Installer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Implementation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Distro {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub libc: Option<Libc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Libc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lib: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct System {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
}
