//! In-memory [`ObjectStore`] with call recording and failure injection.

use crate::object_store::{
    BatchDeleteOutcome, ObjectMeta, ObjectStore, StorageError, MAX_BATCH_DELETE_KEYS,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// A recorded storage call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Get { bucket: String, key: String },
    List { bucket: String, prefix: String, max_results: usize },
    Put { bucket: String, key: String },
    Delete { bucket: String, key: String },
    DeleteBatch { bucket: String, keys: Vec<String> },
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, String), Bytes>,
    calls: Vec<StoreCall>,
    failing_put_prefixes: Vec<String>,
    failing_batch_deletes: usize,
    failing_batch_delete_keys: usize,
    delete_reports_not_found: bool,
}

/// Object store held entirely in memory
#[derive(Default)]
pub struct InMemoryObjectStore {
    state: Mutex<State>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without recording a call
    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        self.state
            .lock()
            .objects
            .insert((bucket.to_string(), key.to_string()), body.into());
    }

    /// Read an object without recording a call
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Remove an object without recording a call, as a concurrent writer would
    pub fn remove(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state
            .lock()
            .objects
            .remove(&(bucket.to_string(), key.to_string()))
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.object(bucket, key).is_some()
    }

    /// All keys in a bucket, in order
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of keys removed through `delete` and `delete_batch`
    pub fn delete_call_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .map(|call| match call {
                StoreCall::Delete { .. } => 1,
                StoreCall::DeleteBatch { keys, .. } => keys.len(),
                _ => 0,
            })
            .sum()
    }

    /// Make every `put` whose key starts with `prefix` fail
    pub fn fail_puts_with_prefix(&self, prefix: &str) {
        self.state
            .lock()
            .failing_put_prefixes
            .push(prefix.to_string());
    }

    /// Make the next `count` batched deletes fail outright
    pub fn fail_next_batch_deletes(&self, count: usize) {
        self.state.lock().failing_batch_deletes = count;
    }

    /// Make the next `count` batched deletes report their first key as failed
    pub fn fail_first_key_of_next_batch_deletes(&self, count: usize) {
        self.state.lock().failing_batch_delete_keys = count;
    }

    /// Make `delete` of an absent object return `NotFound`
    pub fn report_not_found_on_delete(&self, enabled: bool) {
        self.state.lock().delete_reports_not_found = enabled;
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>, StorageError> {
        let mut state = self.state.lock();
        state.calls.push(StoreCall::Get {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
        Ok(state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        max_results: usize,
    ) -> Result<Vec<ObjectMeta>, StorageError> {
        let mut state = self.state.lock();
        state.calls.push(StoreCall::List {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            max_results,
        });
        Ok(state
            .objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .take(max_results)
            .map(|((b, k), body)| ObjectMeta {
                bucket: b.clone(),
                key: k.clone(),
                size: body.len() as u64,
            })
            .collect())
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.calls.push(StoreCall::Put {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
        if state
            .failing_put_prefixes
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
        {
            return Err(StorageError::request("put", bucket, key, "injected failure"));
        }
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.calls.push(StoreCall::Delete {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
        let removed = state
            .objects
            .remove(&(bucket.to_string(), key.to_string()));
        if removed.is_none() && state.delete_reports_not_found {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_batch(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> Result<BatchDeleteOutcome, StorageError> {
        let mut state = self.state.lock();
        state.calls.push(StoreCall::DeleteBatch {
            bucket: bucket.to_string(),
            keys: keys.to_vec(),
        });

        if keys.len() > MAX_BATCH_DELETE_KEYS {
            return Err(StorageError::TooManyKeys {
                count: keys.len(),
                max: MAX_BATCH_DELETE_KEYS,
            });
        }
        if state.failing_batch_deletes > 0 {
            state.failing_batch_deletes -= 1;
            return Err(StorageError::request(
                "delete_batch",
                bucket,
                "",
                "injected failure",
            ));
        }

        let mut outcome = BatchDeleteOutcome::default();
        let fail_first = state.failing_batch_delete_keys > 0 && !keys.is_empty();
        if fail_first {
            state.failing_batch_delete_keys -= 1;
        }

        for (index, key) in keys.iter().enumerate() {
            if fail_first && index == 0 {
                outcome
                    .failed
                    .push((key.clone(), "injected failure".to_string()));
                continue;
            }
            state.objects.remove(&(bucket.to_string(), key.clone()));
            outcome.deleted.push(key.clone());
        }
        Ok(outcome)
    }
}
