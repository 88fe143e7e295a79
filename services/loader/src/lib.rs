//! Linehaul Loader - the load stage
//!
//! Discovers the classified partitions the ingest service wrote for a day,
//! bulk-loads them into every destination dataset, deletes them once every
//! load is confirmed, and re-triggers itself while a day still has backlog.

pub mod config;
pub mod loader;
pub mod postgres;
pub mod warehouse;

pub use config::LoaderConfig;
pub use loader::{
    ContinuationPublisher, KindReport, LoadReport, Loader, LoaderError, LoaderSettings,
};
pub use postgres::PgWarehouse;
pub use warehouse::{DatasetRef, LoadJob, LoadOutcome, TableRef, Warehouse, WarehouseError};
