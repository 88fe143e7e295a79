//! PostgreSQL warehouse.
//!
//! Each dataset is a schema and each destination table stores one `jsonb`
//! document per record:
//!
//! ```sql
//! CREATE TABLE "<dataset>"."<table>" (record jsonb NOT NULL);
//! ```
//!
//! A load job streams its source objects one at a time, inserting each in
//! bounded chunks, all inside a single transaction.

use crate::config::WarehouseConfig;
use crate::warehouse::{LoadJob, LoadOutcome, TableRef, Warehouse, WarehouseError};
use async_trait::async_trait;
use bytes::Bytes;
use linehaul_storage::layout::parse_storage_uri;
use linehaul_storage::ObjectStore;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::collections::HashMap;
use std::iter::Enumerate;
use std::slice::Split;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Records sent per INSERT statement
const INSERT_CHUNK_SIZE: usize = 1000;

pub struct PgWarehouse {
    pools: HashMap<String, PgPool>,
    store: Arc<dyn ObjectStore>,
}

impl PgWarehouse {
    /// Connect one pool per project referenced by the configured datasets
    pub async fn connect(
        config: &WarehouseConfig,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, WarehouseError> {
        let mut pools = HashMap::new();

        for dataset in config.dataset_refs()? {
            if pools.contains_key(&dataset.project) {
                continue;
            }
            let url = config
                .connection_url(&dataset.project)
                .ok_or_else(|| WarehouseError::UnknownProject(dataset.project.clone()))?;

            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(config.acquire_timeout())
                .connect(url)
                .await?;

            info!(project = %dataset.project, "Connected to warehouse database");
            pools.insert(dataset.project, pool);
        }

        Ok(Self::from_pools(pools, store))
    }

    pub fn from_pools(pools: HashMap<String, PgPool>, store: Arc<dyn ObjectStore>) -> Self {
        Self { pools, store }
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    #[instrument(skip(self, job), fields(job_id = %job.job_id, destination = %job.destination))]
    async fn load(&self, job: LoadJob) -> Result<LoadOutcome, WarehouseError> {
        let project = &job.destination.dataset.project;
        let pool = self
            .pools
            .get(project)
            .ok_or_else(|| WarehouseError::UnknownProject(project.clone()))?;

        let statement = insert_statement(&job.destination);
        let mut tx = pool.begin().await?;
        let mut output_rows = 0;

        // At most one source body and one chunk are held at a time; the
        // transaction keeps the job all-or-nothing.
        for uri in &job.source_uris {
            let body = fetch_source(self.store.as_ref(), uri).await?;
            let mut source_rows = 0;

            for chunk in RecordChunks::new(uri, &body, INSERT_CHUNK_SIZE) {
                let chunk = chunk?;
                let result = sqlx::query(&statement)
                    .bind(Json(&chunk))
                    .execute(&mut *tx)
                    .await?;
                source_rows += result.rows_affected();
            }

            debug!(uri = %uri, rows = source_rows, "Inserted load source");
            output_rows += source_rows;
        }

        tx.commit().await?;

        Ok(LoadOutcome {
            job_id: job.job_id,
            output_rows,
        })
    }
}

/// Fetch one load source by its storage URI
pub async fn fetch_source(store: &dyn ObjectStore, uri: &str) -> Result<Bytes, WarehouseError> {
    let (bucket, key) = parse_storage_uri(uri).map_err(|source| WarehouseError::Source {
        uri: uri.to_string(),
        source,
    })?;

    store
        .get(bucket, key)
        .await
        .map_err(|source| WarehouseError::Source {
            uri: uri.to_string(),
            source,
        })?
        .ok_or_else(|| WarehouseError::MissingSource(uri.to_string()))
}

/// Parses an NDJSON body into chunks of at most `chunk_size` JSON objects.
///
/// Blank lines are skipped. The first malformed line yields an error and ends
/// the iteration.
pub struct RecordChunks<'a> {
    uri: &'a str,
    lines: Enumerate<Split<'a, u8, fn(&u8) -> bool>>,
    chunk_size: usize,
    failed: bool,
}

impl<'a> RecordChunks<'a> {
    pub fn new(uri: &'a str, body: &'a [u8], chunk_size: usize) -> Self {
        let is_newline: fn(&u8) -> bool = |b| *b == b'\n';
        Self {
            uri,
            lines: body.split(is_newline).enumerate(),
            chunk_size: chunk_size.max(1),
            failed: false,
        }
    }

    fn parse(&self, index: usize, line: &[u8]) -> Result<Value, WarehouseError> {
        let malformed = |message: String| WarehouseError::MalformedRecord {
            uri: self.uri.to_string(),
            line: index + 1,
            message,
        };

        let record: Value = serde_json::from_slice(line).map_err(|e| malformed(e.to_string()))?;
        if !record.is_object() {
            return Err(malformed("record is not a JSON object".to_string()));
        }
        Ok(record)
    }
}

impl Iterator for RecordChunks<'_> {
    type Item = Result<Vec<Value>, WarehouseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let mut chunk = Vec::new();
        while chunk.len() < self.chunk_size {
            let Some((index, line)) = self.lines.next() else {
                break;
            };
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match self.parse(index, line) {
                Ok(record) => chunk.push(record),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        if chunk.is_empty() {
            None
        } else {
            Some(Ok(chunk))
        }
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn insert_statement(table: &TableRef) -> String {
    format!(
        "INSERT INTO {}.{} (record) SELECT value FROM jsonb_array_elements($1)",
        quote_identifier(&table.dataset.dataset),
        quote_identifier(&table.table)
    )
}
