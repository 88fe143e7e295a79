//! Load orchestration.
//!
//! One run discovers the pending partitions of each event kind for a single
//! day, loads each kind into every destination dataset, and only then deletes
//! exactly the partitions it loaded. Re-running after any failure is safe:
//! partitions are deleted strictly after every load of their kind succeeded.
//!
//! ```text
//! Discover ──empty──▶ done
//!    │
//!    └─non-empty─▶ Load ──▶ Delete ──continue_publishing─▶ Publish
//! ```

use crate::config::{LoaderConfig, RetryConfig};
use crate::warehouse::{DatasetRef, LoadJob, LoadOutcome, Warehouse, WarehouseError};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use linehaul_pipeline::{LinehaulProducer, LoadTrigger, ProducerError};
use linehaul_storage::layout::processed_prefix;
use linehaul_storage::{
    EventKind, InvalidPartitionDay, ObjectMeta, ObjectStore, PartitionDay, StorageError,
    MAX_BATCH_DELETE_KEYS,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(#[from] InvalidPartitionDay),

    #[error("Failed to list {prefix}: {source}")]
    Discovery {
        prefix: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to load {kind} into {destination}: {source}")]
    Load {
        kind: EventKind,
        destination: String,
        #[source]
        source: WarehouseError,
    },

    #[error("Gave up deleting {remaining} loaded {kind} partitions for {day}: {message}")]
    Cleanup {
        kind: EventKind,
        day: PartitionDay,
        remaining: usize,
        message: String,
    },

    #[error("Failed to publish continuation: {0}")]
    Publish(#[from] ProducerError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] WarehouseError),
}

/// Re-publishes a load trigger so a fresh invocation keeps draining a day
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContinuationPublisher: Send + Sync {
    async fn publish(&self, trigger: LoadTrigger) -> Result<(), ProducerError>;
}

#[async_trait]
impl ContinuationPublisher for LinehaulProducer {
    async fn publish(&self, trigger: LoadTrigger) -> Result<(), ProducerError> {
        self.send_load_trigger(&trigger).await.map(|_| ())
    }
}

/// Everything the Loader needs besides its collaborators
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub result_bucket: String,
    pub datasets: Vec<DatasetRef>,
    pub simple_table: String,
    pub download_table: String,
    pub max_objects_per_call: usize,
    pub delete_retry: RetryConfig,
}

impl LoaderSettings {
    pub fn from_config(config: &LoaderConfig) -> Result<Self, WarehouseError> {
        Ok(Self {
            result_bucket: config.loader.result_bucket.clone(),
            datasets: config.warehouse.dataset_refs()?,
            simple_table: config.warehouse.simple_table.clone(),
            download_table: config.warehouse.download_table.clone(),
            max_objects_per_call: config.loader.max_objects_per_call.min(MAX_BATCH_DELETE_KEYS),
            delete_retry: config.loader.delete_retry.clone(),
        })
    }

    fn table_for(&self, kind: EventKind) -> &str {
        match kind {
            EventKind::SimpleRequest => &self.simple_table,
            EventKind::Download => &self.download_table,
        }
    }

    fn delete_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.delete_retry.initial_interval(),
            max_interval: self.delete_retry.max_interval(),
            max_elapsed_time: Some(self.delete_retry.max_elapsed()),
            ..Default::default()
        };
        // Starts the elapsed clock and the first interval from the settings above
        backoff.reset();
        backoff
    }
}

/// Partitions of one kind for one day, as listed at discovery time
#[derive(Debug, Clone)]
struct Batch {
    kind: EventKind,
    day: PartitionDay,
    objects: Vec<ObjectMeta>,
}

/// Outcome of loading one dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLoad {
    pub destination: String,
    pub outcome: LoadOutcome,
}

/// What happened to one kind in a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindReport {
    pub kind: EventKind,
    pub day: PartitionDay,
    pub partitions: usize,
    pub loads: Vec<DatasetLoad>,
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Day named by the trigger, or today for a scheduled run
    pub day: PartitionDay,
    /// Kinds that had partitions, in processing order
    pub kinds: Vec<KindReport>,
    pub continuation_published: bool,
}

impl LoadReport {
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

pub struct Loader {
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
    publisher: Arc<dyn ContinuationPublisher>,
    settings: LoaderSettings,
}

impl Loader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        publisher: Arc<dyn ContinuationPublisher>,
        settings: LoaderSettings,
    ) -> Self {
        Self {
            store,
            warehouse,
            publisher,
            settings,
        }
    }

    pub async fn run(&self, trigger: &LoadTrigger) -> Result<LoadReport, LoaderError> {
        self.run_at(trigger, Utc::now()).await
    }

    /// Run one load cycle as if the clock read `now`
    #[instrument(skip(self, now), fields(bucket = %self.settings.result_bucket))]
    pub async fn run_at(
        &self,
        trigger: &LoadTrigger,
        now: DateTime<Utc>,
    ) -> Result<LoadReport, LoaderError> {
        let (day, scheduled) = match trigger.partition {
            Some(ref partition) => (partition.parse::<PartitionDay>()?, false),
            None => (PartitionDay::from_timestamp(now), true),
        };

        let mut batches = Vec::new();
        for kind in EventKind::ALL {
            if let Some(batch) = self.discover(kind, day, scheduled).await? {
                batches.push(batch);
            }
        }

        let mut report = LoadReport {
            day,
            kinds: Vec::with_capacity(batches.len()),
            continuation_published: false,
        };

        if batches.is_empty() {
            info!(%day, scheduled, "No partitions to load");
            return Ok(report);
        }

        for batch in batches {
            let loads = self.load(&batch).await?;
            let deleted = self.delete(&batch).await?;
            report.kinds.push(KindReport {
                kind: batch.kind,
                day: batch.day,
                partitions: batch.objects.len(),
                loads,
                deleted,
            });
        }

        if trigger.continue_publishing {
            let continuation = LoadTrigger::for_partition(day.to_string(), true);
            self.publisher.publish(continuation).await?;
            metrics::counter!("loader.continuations.published").increment(1);
            info!(%day, "Published continuation");
            report.continuation_published = true;
        }

        Ok(report)
    }

    /// Find the partitions of `kind` to load. A scheduled run drains the
    /// previous day first; days are never mixed in one batch.
    async fn discover(
        &self,
        kind: EventKind,
        day: PartitionDay,
        scheduled: bool,
    ) -> Result<Option<Batch>, LoaderError> {
        let candidates = if scheduled {
            vec![day.previous(), day]
        } else {
            vec![day]
        };

        for candidate in candidates {
            let prefix = processed_prefix(kind, candidate);
            let objects = self
                .store
                .list(
                    &self.settings.result_bucket,
                    &prefix,
                    self.settings.max_objects_per_call,
                )
                .await
                .map_err(|source| LoaderError::Discovery {
                    prefix: prefix.clone(),
                    source,
                })?;

            if !objects.is_empty() {
                debug!(%kind, day = %candidate, partitions = objects.len(), "Discovered partitions");
                return Ok(Some(Batch {
                    kind,
                    day: candidate,
                    objects,
                }));
            }
        }

        Ok(None)
    }

    /// Load a batch into every dataset, one job per dataset
    async fn load(&self, batch: &Batch) -> Result<Vec<DatasetLoad>, LoaderError> {
        let uris: Vec<String> = batch.objects.iter().map(ObjectMeta::uri).collect();
        let table = self.settings.table_for(batch.kind);
        let mut loads = Vec::with_capacity(self.settings.datasets.len());

        for dataset in &self.settings.datasets {
            let destination = dataset.table(table)?;
            let destination_name = destination.to_string();
            let job = LoadJob::new(batch.kind, uris.clone(), destination);

            info!(
                job_id = %job.job_id,
                kind = %batch.kind,
                day = %batch.day,
                partitions = uris.len(),
                destination = %destination_name,
                "Submitting load job"
            );

            let outcome = self.warehouse.load(job).await.map_err(|source| {
                metrics::counter!("loader.load_jobs.failed", "kind" => batch.kind.as_str())
                    .increment(1);
                LoaderError::Load {
                    kind: batch.kind,
                    destination: destination_name.clone(),
                    source,
                }
            })?;

            info!(
                job_id = %outcome.job_id,
                rows = outcome.output_rows,
                destination = %destination_name,
                "Loaded rows"
            );
            metrics::counter!("loader.load_jobs", "kind" => batch.kind.as_str()).increment(1);
            metrics::counter!("loader.rows_loaded", "kind" => batch.kind.as_str())
                .increment(outcome.output_rows);

            loads.push(DatasetLoad {
                destination: destination_name,
                outcome,
            });
        }

        Ok(loads)
    }

    /// Delete a loaded batch, retrying only the keys that failed
    async fn delete(&self, batch: &Batch) -> Result<usize, LoaderError> {
        let bucket = &self.settings.result_bucket;
        let keys: Vec<String> = batch.objects.iter().map(|o| o.key.clone()).collect();
        let mut deleted = 0;

        for chunk in keys.chunks(MAX_BATCH_DELETE_KEYS) {
            let mut pending = chunk.to_vec();
            let mut backoff = self.settings.delete_backoff();

            loop {
                let failure = match self.store.delete_batch(bucket, &pending).await {
                    Ok(outcome) => {
                        deleted += outcome.deleted.len();
                        if outcome.is_complete() {
                            break;
                        }
                        pending = outcome.failed_keys();
                        let (key, reason) = &outcome.failed[0];
                        format!("{} keys failed, first {key}: {reason}", outcome.failed.len())
                    }
                    Err(e) => e.to_string(),
                };

                match backoff.next_backoff() {
                    Some(delay) => {
                        warn!(
                            kind = %batch.kind,
                            remaining = pending.len(),
                            delay_ms = delay.as_millis() as u64,
                            error = %failure,
                            "Partition delete failed, retrying"
                        );
                        metrics::counter!("loader.delete.retries").increment(1);
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(
                            kind = %batch.kind,
                            day = %batch.day,
                            remaining = pending.len(),
                            error = %failure,
                            "Giving up on deleting loaded partitions; they will be loaded again"
                        );
                        return Err(LoaderError::Cleanup {
                            kind: batch.kind,
                            day: batch.day,
                            remaining: pending.len(),
                            message: failure,
                        });
                    }
                }
            }
        }

        metrics::counter!("loader.partitions.deleted", "kind" => batch.kind.as_str())
            .increment(deleted as u64);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::MockWarehouse;
    use chrono::TimeZone;
    use linehaul_storage::layout::processed_key;
    use linehaul_storage::{InMemoryObjectStore, StoreCall};

    const BUCKET: &str = "linehaul-results";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 8, 3, 0, 0).unwrap()
    }

    fn day(s: &str) -> PartitionDay {
        s.parse().unwrap()
    }

    fn settings(datasets: &[&str]) -> LoaderSettings {
        LoaderSettings {
            result_bucket: BUCKET.to_string(),
            datasets: datasets
                .iter()
                .map(|d| DatasetRef::parse(d, "the-psf").unwrap())
                .collect(),
            simple_table: "simple_requests".to_string(),
            download_table: "file_downloads".to_string(),
            max_objects_per_call: 1000,
            delete_retry: RetryConfig {
                initial_interval_ms: 1,
                max_interval_ms: 2,
                max_elapsed_ms: 50,
            },
        }
    }

    fn seed(store: &InMemoryObjectStore, kind: EventKind, partition: &str, sources: &[&str]) -> Vec<String> {
        sources
            .iter()
            .map(|source| {
                let key = processed_key(kind, day(partition), source);
                store.insert(BUCKET, &key, "{\"n\":1}\n");
                key
            })
            .collect()
    }

    fn ok_warehouse(expected_loads: usize) -> MockWarehouse {
        let mut warehouse = MockWarehouse::new();
        warehouse
            .expect_load()
            .times(expected_loads)
            .returning(|job| {
                Ok(LoadOutcome {
                    output_rows: job.source_uris.len() as u64,
                    job_id: job.job_id,
                })
            });
        warehouse
    }

    fn no_publish() -> MockContinuationPublisher {
        let mut publisher = MockContinuationPublisher::new();
        publisher.expect_publish().times(0);
        publisher
    }

    fn loader(
        store: &Arc<InMemoryObjectStore>,
        warehouse: MockWarehouse,
        publisher: MockContinuationPublisher,
        settings: LoaderSettings,
    ) -> Loader {
        Loader::new(store.clone(), Arc::new(warehouse), Arc::new(publisher), settings)
    }

    fn delete_batches(store: &InMemoryObjectStore) -> Vec<Vec<String>> {
        store
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                StoreCall::DeleteBatch { keys, .. } => Some(keys),
                _ => None,
            })
            .collect()
    }

    fn listed_prefixes(store: &InMemoryObjectStore) -> Vec<String> {
        store
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                StoreCall::List { prefix, .. } => Some(prefix),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_loads_then_deletes_todays_partitions() {
        let store = Arc::new(InMemoryObjectStore::new());
        let keys = seed(&store, EventKind::SimpleRequest, "20210108", &["a", "b", "c"]);
        store.insert(BUCKET, "unprocessed/20210108/a.txt", "junk\n");

        let expected_uris: Vec<String> = keys.iter().map(|k| format!("s3://{BUCKET}/{k}")).collect();
        let mut warehouse = MockWarehouse::new();
        warehouse
            .expect_load()
            .withf(move |job| {
                job.kind == EventKind::SimpleRequest
                    && job.source_uris == expected_uris
                    && job.destination.table == "simple_requests"
            })
            .times(2)
            .returning(|job| {
                Ok(LoadOutcome {
                    job_id: job.job_id,
                    output_rows: 3,
                })
            });

        let report = loader(&store, warehouse, no_publish(), settings(&["pypi", "other-project.mirror"]))
            .run_at(&LoadTrigger::scheduled(), now())
            .await
            .unwrap();

        assert_eq!(report.kinds.len(), 1);
        let kind = &report.kinds[0];
        assert_eq!(kind.day, day("20210108"));
        assert_eq!(kind.partitions, 3);
        assert_eq!(kind.deleted, 3);
        let destinations: Vec<&str> = kind.loads.iter().map(|l| l.destination.as_str()).collect();
        assert_eq!(
            destinations,
            vec!["the-psf.pypi:simple_requests", "other-project.mirror:simple_requests"]
        );

        assert_eq!(delete_batches(&store), vec![keys]);
        assert_eq!(store.keys(BUCKET), vec!["unprocessed/20210108/a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_load_failure_deletes_nothing() {
        let store = Arc::new(InMemoryObjectStore::new());
        let keys = seed(&store, EventKind::Download, "20210107", &["a", "b"]);

        let mut warehouse = MockWarehouse::new();
        warehouse.expect_load().times(1).returning(|job| {
            Err(WarehouseError::JobFailed {
                job_id: job.job_id,
                message: "quota exceeded".to_string(),
            })
        });

        let err = loader(&store, warehouse, no_publish(), settings(&["pypi", "mirror"]))
            .run_at(&LoadTrigger::for_partition("20210107", true), now())
            .await
            .unwrap_err();

        assert!(matches!(err, LoaderError::Load { kind: EventKind::Download, .. }));
        assert_eq!(store.delete_call_count(), 0);

        let listed = store
            .list(BUCKET, &processed_prefix(EventKind::Download, day("20210107")), 1000)
            .await
            .unwrap();
        assert_eq!(listed.len(), keys.len());
    }

    #[tokio::test]
    async fn test_failure_in_later_dataset_deletes_nothing() {
        let store = Arc::new(InMemoryObjectStore::new());
        let keys = seed(&store, EventKind::SimpleRequest, "20210107", &["a", "b"]);

        let mut sequence = mockall::Sequence::new();
        let mut warehouse = MockWarehouse::new();
        warehouse
            .expect_load()
            .withf(|job| job.destination.to_string() == "the-psf.pypi:simple_requests")
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|job| {
                Ok(LoadOutcome {
                    output_rows: 2,
                    job_id: job.job_id,
                })
            });
        warehouse
            .expect_load()
            .withf(|job| job.destination.to_string() == "the-psf.mirror:simple_requests")
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|job| {
                Err(WarehouseError::JobFailed {
                    job_id: job.job_id,
                    message: "backend error".to_string(),
                })
            });

        let err = loader(&store, warehouse, no_publish(), settings(&["pypi", "mirror"]))
            .run_at(&LoadTrigger::for_partition("20210107", true), now())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LoaderError::Load { kind: EventKind::SimpleRequest, ref destination, .. }
                if destination == "the-psf.mirror:simple_requests"
        ));
        assert_eq!(store.delete_call_count(), 0);

        let listed = store
            .list(BUCKET, &processed_prefix(EventKind::SimpleRequest, day("20210107")), 1000)
            .await
            .unwrap();
        assert_eq!(listed.len(), keys.len());
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let store = Arc::new(InMemoryObjectStore::new());
        seed(&store, EventKind::Download, "20210108", &["a"]);

        let loader = loader(&store, ok_warehouse(1), no_publish(), settings(&["pypi"]));

        let first = loader.run_at(&LoadTrigger::scheduled(), now()).await.unwrap();
        assert!(!first.is_empty());

        store.clear_calls();
        let second = loader.run_at(&LoadTrigger::scheduled(), now()).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(store.delete_call_count(), 0);
    }

    #[tokio::test]
    async fn test_no_continuation_when_nothing_found() {
        let store = Arc::new(InMemoryObjectStore::new());
        seed(&store, EventKind::Download, "20210106", &["other-day"]);

        let report = loader(&store, ok_warehouse(0), no_publish(), settings(&["pypi"]))
            .run_at(&LoadTrigger::for_partition("20210107", true), now())
            .await
            .unwrap();

        assert!(report.is_empty());
        assert!(!report.continuation_published);
    }

    #[tokio::test]
    async fn test_continuation_carries_the_day() {
        let store = Arc::new(InMemoryObjectStore::new());
        seed(&store, EventKind::SimpleRequest, "20210107", &["a"]);

        let mut publisher = MockContinuationPublisher::new();
        publisher
            .expect_publish()
            .withf(|trigger| *trigger == LoadTrigger::for_partition("20210107", true))
            .times(1)
            .returning(|_| Ok(()));

        let report = loader(&store, ok_warehouse(1), publisher, settings(&["pypi"]))
            .run_at(&LoadTrigger::for_partition("20210107", true), now())
            .await
            .unwrap();

        assert!(report.continuation_published);
    }

    #[tokio::test]
    async fn test_no_continuation_without_flag() {
        let store = Arc::new(InMemoryObjectStore::new());
        seed(&store, EventKind::SimpleRequest, "20210107", &["a"]);

        let report = loader(&store, ok_warehouse(1), no_publish(), settings(&["pypi"]))
            .run_at(&LoadTrigger::for_partition("20210107", false), now())
            .await
            .unwrap();

        assert!(!report.continuation_published);
        assert_eq!(report.kinds[0].deleted, 1);
    }

    #[tokio::test]
    async fn test_scheduled_run_drains_previous_day_first() {
        let store = Arc::new(InMemoryObjectStore::new());
        let yesterday = seed(&store, EventKind::Download, "20210107", &["late"]);
        let today_downloads = seed(&store, EventKind::Download, "20210108", &["early"]);
        let today_simple = seed(&store, EventKind::SimpleRequest, "20210108", &["s"]);

        let report = loader(&store, ok_warehouse(2), no_publish(), settings(&["pypi"]))
            .run_at(&LoadTrigger::scheduled(), now())
            .await
            .unwrap();

        assert_eq!(report.day, day("20210108"));
        assert_eq!(report.kinds[0].kind, EventKind::Download);
        assert_eq!(report.kinds[0].day, day("20210107"));
        assert_eq!(report.kinds[1].kind, EventKind::SimpleRequest);
        assert_eq!(report.kinds[1].day, day("20210108"));

        assert_eq!(
            listed_prefixes(&store),
            vec![
                "processed/file_downloads/20210107/".to_string(),
                "processed/simple_requests/20210107/".to_string(),
                "processed/simple_requests/20210108/".to_string(),
            ]
        );
        assert_eq!(delete_batches(&store), vec![yesterday, today_simple]);
        assert!(store.contains(BUCKET, &today_downloads[0]));
    }

    #[tokio::test]
    async fn test_explicit_trigger_lists_only_its_day() {
        let store = Arc::new(InMemoryObjectStore::new());
        seed(&store, EventKind::Download, "20210106", &["older"]);

        let report = loader(&store, ok_warehouse(0), no_publish(), settings(&["pypi"]))
            .run_at(&LoadTrigger::for_partition("20210107", false), now())
            .await
            .unwrap();

        assert!(report.is_empty());
        assert_eq!(
            listed_prefixes(&store),
            vec![
                "processed/file_downloads/20210107/".to_string(),
                "processed/simple_requests/20210107/".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_discovery_is_capped() {
        let store = Arc::new(InMemoryObjectStore::new());
        let keys = seed(&store, EventKind::Download, "20210107", &["a", "b", "c"]);
        let mut settings = settings(&["pypi"]);
        settings.max_objects_per_call = 2;

        let mut publisher = MockContinuationPublisher::new();
        publisher.expect_publish().times(1).returning(|_| Ok(()));

        let report = loader(&store, ok_warehouse(1), publisher, settings)
            .run_at(&LoadTrigger::for_partition("20210107", true), now())
            .await
            .unwrap();

        assert_eq!(report.kinds[0].partitions, 2);
        assert_eq!(store.keys(BUCKET), vec![keys[2].clone()]);
        assert!(report.continuation_published);
    }

    #[tokio::test]
    async fn test_partial_delete_failure_retries_failed_keys() {
        let store = Arc::new(InMemoryObjectStore::new());
        let keys = seed(&store, EventKind::Download, "20210107", &["a", "b", "c"]);
        store.fail_first_key_of_next_batch_deletes(2);

        let report = loader(&store, ok_warehouse(1), no_publish(), settings(&["pypi"]))
            .run_at(&LoadTrigger::for_partition("20210107", false), now())
            .await
            .unwrap();

        assert_eq!(report.kinds[0].deleted, 3);
        assert_eq!(
            delete_batches(&store),
            vec![keys.clone(), vec![keys[0].clone()], vec![keys[0].clone()]]
        );
        assert!(store.keys(BUCKET).is_empty());
    }

    #[tokio::test]
    async fn test_delete_retry_exhaustion_is_an_error() {
        let store = Arc::new(InMemoryObjectStore::new());
        seed(&store, EventKind::Download, "20210107", &["a", "b"]);
        store.fail_next_batch_deletes(usize::MAX);

        let err = loader(&store, ok_warehouse(1), no_publish(), settings(&["pypi"]))
            .run_at(&LoadTrigger::for_partition("20210107", true), now())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LoaderError::Cleanup { kind: EventKind::Download, remaining: 2, .. }
        ));
        assert!(delete_batches(&store).len() > 1);
        assert_eq!(store.keys(BUCKET).len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_partition_is_rejected() {
        let store = Arc::new(InMemoryObjectStore::new());

        let err = loader(&store, ok_warehouse(0), no_publish(), settings(&["pypi"]))
            .run_at(&LoadTrigger::for_partition("2021-01-07", true), now())
            .await
            .unwrap_err();

        assert!(matches!(err, LoaderError::InvalidTrigger(_)));
        assert!(store.calls().is_empty());
    }
}
