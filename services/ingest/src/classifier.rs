//! Classifier stage: one raw log object in, partitioned NDJSON artifacts out.
//!
//! Every line of the source ends up either as a record in exactly one
//! `(kind, day)` partition or verbatim in the unprocessed artifact. The
//! source object is deleted only after every partition upload succeeded.

use crate::parser::{LineParser, ParseError};
use crate::source::{trim_line_ending, Compression, RawLines};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use linehaul_storage::layout::{
    processed_key, source_identifier, storage_uri, unprocessed_key,
};
use linehaul_storage::{EventKind, ObjectStore, PartitionDay, StorageError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const PROCESSED_CONTENT_TYPE: &str = "application/x-ndjson";
const UNPROCESSED_CONTENT_TYPE: &str = "text/plain";

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("failed to fetch {uri}: {source}")]
    Fetch {
        uri: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to decompress {uri}: {source}")]
    Decompress {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to upload partition {key}: {source}")]
    Upload {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to delete source {uri}: {source}")]
    DeleteSource {
        uri: String,
        #[source]
        source: StorageError,
    },
}

/// Per-object line counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineCounts {
    pub total: usize,
    pub simple: usize,
    pub download: usize,
    pub unprocessed: usize,
}

impl LineCounts {
    fn record(&mut self, kind: EventKind) {
        match kind {
            EventKind::SimpleRequest => self.simple += 1,
            EventKind::Download => self.download += 1,
        }
    }
}

/// What one classification run wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationReport {
    pub source: String,
    pub lines: LineCounts,
    /// Keys of the uploaded partitions, in (kind, day) order
    pub partitions: Vec<String>,
    /// Key of the unprocessed artifact, if one was written
    pub unprocessed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationOutcome {
    /// The source object no longer exists; a previous run consumed it
    Skipped,
    Processed(ClassificationReport),
}

/// Accumulated NDJSON body of one partition
#[derive(Debug, Default)]
pub struct PartitionBuffer {
    body: Vec<u8>,
    records: usize,
}

impl PartitionBuffer {
    pub fn append(&mut self, record: &[u8]) {
        self.body.extend_from_slice(record);
        self.body.push(b'\n');
        self.records += 1;
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn into_body(self) -> Bytes {
        Bytes::from(self.body)
    }
}

/// Partitions of one source object keyed by (kind, day), created on first use
#[derive(Debug, Default)]
pub struct PartitionSet {
    partitions: BTreeMap<(EventKind, PartitionDay), PartitionBuffer>,
}

impl PartitionSet {
    pub fn partition(&mut self, kind: EventKind, day: PartitionDay) -> &mut PartitionBuffer {
        self.partitions.entry((kind, day)).or_default()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

impl IntoIterator for PartitionSet {
    type Item = ((EventKind, PartitionDay), PartitionBuffer);
    type IntoIter = std::collections::btree_map::IntoIter<(EventKind, PartitionDay), PartitionBuffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.partitions.into_iter()
    }
}

/// Classifies raw log objects into the result bucket
pub struct Classifier {
    store: Arc<dyn ObjectStore>,
    parser: Arc<dyn LineParser>,
    result_bucket: String,
}

impl Classifier {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        parser: Arc<dyn LineParser>,
        result_bucket: impl Into<String>,
    ) -> Self {
        Self {
            store,
            parser,
            result_bucket: result_bucket.into(),
        }
    }

    pub async fn process(
        &self,
        bucket: &str,
        name: &str,
    ) -> Result<ClassificationOutcome, ClassifierError> {
        self.process_at(bucket, name, Utc::now()).await
    }

    /// Classify one raw object. `now` only dates the unprocessed artifact
    /// when no line parsed into an event.
    #[instrument(skip(self, now), fields(result_bucket = %self.result_bucket))]
    pub async fn process_at(
        &self,
        bucket: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<ClassificationOutcome, ClassifierError> {
        let started = Instant::now();
        let uri = storage_uri(bucket, name);

        let Some(data) = self
            .store
            .get(bucket, name)
            .await
            .map_err(|source| ClassifierError::Fetch {
                uri: uri.clone(),
                source,
            })?
        else {
            info!(%uri, "Source object is gone, already processed");
            metrics::counter!("ingest.objects.skipped").increment(1);
            return Ok(ClassificationOutcome::Skipped);
        };

        info!(%uri, size_bytes = data.len(), "Beginning processing");

        let compression = Compression::detect(name, &data);
        let mut lines = LineCounts::default();
        let mut partitions = PartitionSet::default();
        let mut unprocessed: Vec<u8> = Vec::new();
        let mut min_timestamp: Option<DateTime<Utc>> = None;

        for raw in RawLines::new(compression.reader(&data)) {
            let raw = raw.map_err(|source| ClassifierError::Decompress {
                uri: uri.clone(),
                source,
            })?;
            lines.total += 1;

            let parsed = std::str::from_utf8(trim_line_ending(&raw))
                .map_err(|_| ParseError::InvalidUtf8)
                .and_then(|line| self.parser.parse(line));

            let event = match parsed {
                Ok(Some(event)) => event,
                Ok(None) => {
                    push_unprocessed(&mut unprocessed, &raw);
                    lines.unprocessed += 1;
                    continue;
                }
                Err(e) => {
                    debug!(line = lines.total, error = %e, "Unparseable line");
                    push_unprocessed(&mut unprocessed, &raw);
                    lines.unprocessed += 1;
                    continue;
                }
            };

            let record = match event.to_record() {
                Ok(record) => record,
                Err(e) => {
                    warn!(line = lines.total, error = %e, "Failed to serialize event");
                    push_unprocessed(&mut unprocessed, &raw);
                    lines.unprocessed += 1;
                    continue;
                }
            };

            let timestamp = event.timestamp();
            min_timestamp = Some(min_timestamp.map_or(timestamp, |min| min.min(timestamp)));
            partitions
                .partition(event.kind(), event.partition_day())
                .append(&record);
            lines.record(event.kind());
        }

        info!(
            %uri,
            compression = compression.name(),
            total = lines.total,
            simple_requests = lines.simple,
            file_downloads = lines.download,
            unprocessed = lines.unprocessed,
            "Classified source object"
        );

        let source_id = source_identifier(name);

        let mut written = Vec::with_capacity(partitions.len());
        for ((kind, day), buffer) in partitions {
            let key = processed_key(kind, day, &source_id);
            let records = buffer.records();
            self.store
                .put(&self.result_bucket, &key, buffer.into_body(), PROCESSED_CONTENT_TYPE)
                .await
                .map_err(|source| ClassifierError::Upload {
                    key: key.clone(),
                    source,
                })?;
            debug!(%key, records, "Uploaded partition");
            metrics::counter!("ingest.partitions.uploaded", "kind" => kind.as_str()).increment(1);
            written.push(key);
        }

        let unprocessed_written = if unprocessed.is_empty() {
            None
        } else {
            let day = PartitionDay::from_timestamp(min_timestamp.unwrap_or(now));
            self.upload_unprocessed(unprocessed_key(day, &source_id), unprocessed)
                .await
        };

        match self.store.delete(bucket, name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(%uri, "Source already deleted by a concurrent run");
            }
            Err(source) => return Err(ClassifierError::DeleteSource { uri, source }),
        }

        metrics::counter!("ingest.lines.classified", "outcome" => "simple_requests")
            .increment(lines.simple as u64);
        metrics::counter!("ingest.lines.classified", "outcome" => "file_downloads")
            .increment(lines.download as u64);
        metrics::counter!("ingest.lines.classified", "outcome" => "unprocessed")
            .increment(lines.unprocessed as u64);
        metrics::counter!("ingest.objects.processed").increment(1);
        metrics::histogram!("ingest.process.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        Ok(ClassificationOutcome::Processed(ClassificationReport {
            source: uri,
            lines,
            partitions: written,
            unprocessed: unprocessed_written,
        }))
    }

    /// Best effort: a failure is logged and the lines are only counted
    async fn upload_unprocessed(&self, key: String, body: Vec<u8>) -> Option<String> {
        match self
            .store
            .put(&self.result_bucket, &key, Bytes::from(body), UNPROCESSED_CONTENT_TYPE)
            .await
        {
            Ok(()) => Some(key),
            Err(e) => {
                warn!(%key, error = %e, "Failed to upload unprocessed lines");
                metrics::counter!("ingest.unprocessed.upload_failures").increment(1);
                None
            }
        }
    }
}

fn push_unprocessed(buffer: &mut Vec<u8>, raw: &[u8]) {
    buffer.extend_from_slice(raw);
    if !raw.ends_with(b"\n") {
        buffer.push(b'\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{FastlyLineParser, MockLineParser};
    use chrono::TimeZone;
    use linehaul_storage::{InMemoryObjectStore, StoreCall};
    use std::io::Write;

    const RAW_BUCKET: &str = "linehaul-logs";
    const RESULT_BUCKET: &str = "linehaul-results";
    const SOURCE: &str =
        "downloads-2021-01-07-20-55-2021-01-07T20-55-00.000-B8Hs_G6d6xN61En2ypwk.log.gz";
    const SOURCE_ID: &str =
        "downloads-2021-01-07-20-55-2021-01-07T20-55-00.000-B8Hs_G6d6xN61En2ypwk";

    fn line(kind: &str, timestamp: &str) -> String {
        format!(
            "<134>2021-01-07T20:54:56Z cache-iad2120 linehaul[411617]: 2@{kind}|{timestamp}|US|/packages/ab/cd/requests-2.25.1-py2.py3-none-any.whl|TLSv1.2|ECDHE-RSA-AES128-GCM-SHA256|requests|2.25.1|bdist_wheel|pip/20.1.1 {{\"installer\":{{\"name\":\"pip\",\"version\":\"20.1.1\"}}}}\n"
        )
    }

    fn simple_line(timestamp: &str) -> String {
        format!("simple|{timestamp}|DE|/simple/numpy/|TLSv1.3|TLS_AES_128_GCM_SHA256|||(null)|pip/21.0\n")
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 3, 1, 12, 0, 0).unwrap()
    }

    fn classifier(store: &Arc<InMemoryObjectStore>) -> Classifier {
        Classifier::new(store.clone(), Arc::new(FastlyLineParser), RESULT_BUCKET)
    }

    fn processed(outcome: ClassificationOutcome) -> ClassificationReport {
        match outcome {
            ClassificationOutcome::Processed(report) => report,
            ClassificationOutcome::Skipped => panic!("expected the object to be processed"),
        }
    }

    fn body_lines(store: &InMemoryObjectStore, key: &str) -> Vec<String> {
        let body = store.object(RESULT_BUCKET, key).unwrap();
        String::from_utf8(body.to_vec())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_download_and_malformed_line() {
        let store = Arc::new(InMemoryObjectStore::new());
        let input = format!(
            "{}this line is not an access log\n",
            line("download", "Thu, 07 Jan 2021 20:54:56 GMT")
        );
        store.insert(RAW_BUCKET, SOURCE, gzip(input.as_bytes()));

        let report = processed(classifier(&store).process_at(RAW_BUCKET, SOURCE, now()).await.unwrap());

        let partition = format!("processed/file_downloads/20210107/file_downloads-{SOURCE_ID}.json");
        let unprocessed = format!("unprocessed/20210107/{SOURCE_ID}.txt");
        assert_eq!(report.partitions, vec![partition.clone()]);
        assert_eq!(report.unprocessed, Some(unprocessed.clone()));
        assert_eq!(
            report.lines,
            LineCounts {
                total: 2,
                simple: 0,
                download: 1,
                unprocessed: 1
            }
        );

        let records = body_lines(&store, &partition);
        assert_eq!(records.len(), 1);
        let record: serde_json::Value = serde_json::from_str(&records[0]).unwrap();
        assert_eq!(record["file"]["filename"], "requests-2.25.1-py2.py3-none-any.whl");

        assert_eq!(
            body_lines(&store, &unprocessed),
            vec!["this line is not an access log".to_string()]
        );
        assert!(!store.contains(RAW_BUCKET, SOURCE));
    }

    #[tokio::test]
    async fn test_absent_source_is_skipped() {
        let store = Arc::new(InMemoryObjectStore::new());

        let outcome = classifier(&store).process_at(RAW_BUCKET, SOURCE, now()).await.unwrap();

        assert_eq!(outcome, ClassificationOutcome::Skipped);
        assert!(store.keys(RESULT_BUCKET).is_empty());
        assert_eq!(store.delete_call_count(), 0);
    }

    #[tokio::test]
    async fn test_every_line_is_accounted_for() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut input = Vec::new();
        input.extend(line("download", "Thu, 07 Jan 2021 20:54:56 GMT").into_bytes());
        input.extend(simple_line("Thu, 07 Jan 2021 21:00:00 GMT").into_bytes());
        input.extend(b"\xff\xfe not utf-8\n");
        input.extend(b"\n");
        input.extend(line("upload", "Thu, 07 Jan 2021 20:54:56 GMT").into_bytes());
        input.extend(simple_line("Thu, 07 Jan 2021 22:00:00 GMT").trim_end().as_bytes());
        store.insert(RAW_BUCKET, SOURCE, gzip(&input));

        let report = processed(classifier(&store).process_at(RAW_BUCKET, SOURCE, now()).await.unwrap());

        assert_eq!(report.lines.total, 6);
        assert_eq!(report.lines.simple, 2);
        assert_eq!(report.lines.download, 1);
        assert_eq!(report.lines.unprocessed, 3);

        let records: usize = report
            .partitions
            .iter()
            .map(|key| body_lines(&store, key).len())
            .sum();
        let unprocessed = store
            .object(RESULT_BUCKET, report.unprocessed.as_deref().unwrap())
            .unwrap();
        let unprocessed_lines = unprocessed.iter().filter(|b| **b == b'\n').count();
        assert_eq!(records + unprocessed_lines, report.lines.total);
        assert!(unprocessed.starts_with(b"\xff\xfe not utf-8\n\n"));
    }

    #[tokio::test]
    async fn test_events_partition_by_event_time() {
        let store = Arc::new(InMemoryObjectStore::new());
        let input = format!(
            "{}{}{}",
            line("download", "Fri, 08 Jan 2021 00:00:01 GMT"),
            line("download", "Thu, 07 Jan 2021 23:59:59 GMT"),
            simple_line("Fri, 08 Jan 2021 00:10:00 GMT"),
        );
        store.insert(RAW_BUCKET, SOURCE, gzip(input.as_bytes()));

        let report = processed(classifier(&store).process_at(RAW_BUCKET, SOURCE, now()).await.unwrap());

        assert_eq!(
            report.partitions,
            vec![
                format!("processed/simple_requests/20210108/simple_requests-{SOURCE_ID}.json"),
                format!("processed/file_downloads/20210107/file_downloads-{SOURCE_ID}.json"),
                format!("processed/file_downloads/20210108/file_downloads-{SOURCE_ID}.json"),
            ]
        );
        assert_eq!(report.unprocessed, None);
    }

    #[tokio::test]
    async fn test_records_keep_input_order() {
        let store = Arc::new(InMemoryObjectStore::new());
        let input = format!(
            "{}{}{}",
            simple_line("Thu, 07 Jan 2021 10:00:03 GMT"),
            simple_line("Thu, 07 Jan 2021 10:00:01 GMT"),
            simple_line("Thu, 07 Jan 2021 10:00:02 GMT"),
        );
        store.insert(RAW_BUCKET, "simple-abc.log.gz", gzip(input.as_bytes()));

        let report = processed(
            classifier(&store)
                .process_at(RAW_BUCKET, "simple-abc.log.gz", now())
                .await
                .unwrap(),
        );

        let timestamps: Vec<String> = body_lines(&store, &report.partitions[0])
            .iter()
            .map(|record| {
                let value: serde_json::Value = serde_json::from_str(record).unwrap();
                value["timestamp"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            timestamps,
            vec![
                "2021-01-07 10:00:03 +00:00",
                "2021-01-07 10:00:01 +00:00",
                "2021-01-07 10:00:02 +00:00"
            ]
        );
    }

    #[tokio::test]
    async fn test_unprocessed_day_without_events_is_processing_day() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert(RAW_BUCKET, "junk.log.gz", gzip(b"nothing useful\n"));

        let report = processed(
            classifier(&store)
                .process_at(RAW_BUCKET, "junk.log.gz", now())
                .await
                .unwrap(),
        );

        assert!(report.partitions.is_empty());
        assert_eq!(report.unprocessed.as_deref(), Some("unprocessed/20210301/junk.txt"));
    }

    #[tokio::test]
    async fn test_unprocessed_upload_failure_is_swallowed() {
        let store = Arc::new(InMemoryObjectStore::new());
        let input = format!("{}garbage\n", line("download", "Thu, 07 Jan 2021 20:54:56 GMT"));
        store.insert(RAW_BUCKET, SOURCE, gzip(input.as_bytes()));
        store.fail_puts_with_prefix("unprocessed/");

        let report = processed(classifier(&store).process_at(RAW_BUCKET, SOURCE, now()).await.unwrap());

        assert_eq!(report.unprocessed, None);
        assert_eq!(report.lines.unprocessed, 1);
        assert_eq!(report.partitions.len(), 1);
        assert!(!store.contains(RAW_BUCKET, SOURCE));
    }

    #[tokio::test]
    async fn test_partition_upload_failure_keeps_source() {
        let store = Arc::new(InMemoryObjectStore::new());
        let input = line("download", "Thu, 07 Jan 2021 20:54:56 GMT");
        store.insert(RAW_BUCKET, SOURCE, gzip(input.as_bytes()));
        store.fail_puts_with_prefix("processed/");

        let err = classifier(&store)
            .process_at(RAW_BUCKET, SOURCE, now())
            .await
            .unwrap_err();

        assert!(matches!(err, ClassifierError::Upload { .. }));
        assert!(store.contains(RAW_BUCKET, SOURCE));
        assert_eq!(store.delete_call_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_source_writes_nothing() {
        let store = Arc::new(InMemoryObjectStore::new());
        let compressed = gzip(line("download", "Thu, 07 Jan 2021 20:54:56 GMT").as_bytes());
        store.insert(RAW_BUCKET, SOURCE, compressed[..compressed.len() / 2].to_vec());

        let err = classifier(&store)
            .process_at(RAW_BUCKET, SOURCE, now())
            .await
            .unwrap_err();

        assert!(matches!(err, ClassifierError::Decompress { .. }));
        assert!(store.keys(RESULT_BUCKET).is_empty());
        assert!(store.contains(RAW_BUCKET, SOURCE));
    }

    #[tokio::test]
    async fn test_parser_errors_go_to_unprocessed() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert(RAW_BUCKET, "raw.log", "first\nsecond\n");

        let mut parser = MockLineParser::new();
        parser
            .expect_parse()
            .times(2)
            .returning(|_| Err(ParseError::FieldCount(1)));

        let classifier = Classifier::new(store.clone(), Arc::new(parser), RESULT_BUCKET);
        let report = processed(classifier.process_at(RAW_BUCKET, "raw.log", now()).await.unwrap());

        assert_eq!(report.lines.unprocessed, 2);
        assert_eq!(
            body_lines(&store, "unprocessed/20210301/raw.txt"),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[tokio::test]
    async fn test_concurrent_delete_counts_as_success() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert(RAW_BUCKET, SOURCE, gzip(b"line\n"));
        store.report_not_found_on_delete(true);

        // Another invocation finishes and deletes the source mid-run
        let racing = store.clone();
        let mut parser = MockLineParser::new();
        parser.expect_parse().times(1).returning(move |_| {
            racing.remove(RAW_BUCKET, SOURCE);
            Ok(None)
        });

        let classifier = Classifier::new(store.clone(), Arc::new(parser), RESULT_BUCKET);
        let outcome = classifier.process_at(RAW_BUCKET, SOURCE, now()).await.unwrap();

        assert!(matches!(outcome, ClassificationOutcome::Processed(_)));
        assert!(store.calls().contains(&StoreCall::Delete {
            bucket: RAW_BUCKET.to_string(),
            key: SOURCE.to_string(),
        }));
    }

    #[test]
    fn test_partition_set_get_or_create() {
        let day: PartitionDay = "20210107".parse().unwrap();
        let mut set = PartitionSet::default();
        set.partition(EventKind::Download, day).append(b"{}");
        set.partition(EventKind::Download, day).append(b"{}");
        set.partition(EventKind::SimpleRequest, day).append(b"{}");

        assert_eq!(set.len(), 2);
        let (_, buffer) = set.into_iter().last().unwrap();
        assert_eq!(buffer.records(), 2);
        assert_eq!(buffer.into_body(), Bytes::from_static(b"{}\n{}\n"));
    }
}
