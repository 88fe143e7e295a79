//! Linehaul Ingest - the Classifier stage
//!
//! Reads one raw, compressed edge access-log object, classifies every line
//! into a structured event and writes the events as date-partitioned NDJSON
//! artifacts that the Loader picks up. Lines that do not classify are kept
//! verbatim in an unprocessed artifact.

pub mod classifier;
pub mod config;
pub mod events;
pub mod parser;
pub mod source;

pub use classifier::{
    ClassificationOutcome, ClassificationReport, Classifier, ClassifierError, LineCounts,
    PartitionSet,
};
pub use config::IngestConfig;
pub use events::Event;
pub use parser::{FastlyLineParser, LineParser, ParseError};
