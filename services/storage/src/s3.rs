use crate::config::S3Config;
use crate::object_store::{
    BatchDeleteOutcome, ObjectMeta, ObjectStore, StorageError, MAX_BATCH_DELETE_KEYS,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info, instrument};

/// Page size ceiling for `ListObjectsV2`
const LIST_PAGE_SIZE: usize = 1000;

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 object store initialized"
        );

        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>, StorageError> {
        let response = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    debug!("Object not found");
                    return Ok(None);
                }
                return Err(StorageError::request(
                    "get",
                    bucket,
                    key,
                    DisplayErrorContext(&e).to_string(),
                ));
            }
        };

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::request("get", bucket, key, e.to_string()))?;

        Ok(Some(body.into_bytes()))
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        max_results: usize,
    ) -> Result<Vec<ObjectMeta>, StorageError> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        while objects.len() < max_results {
            let page_size = (max_results - objects.len()).min(LIST_PAGE_SIZE);

            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .max_keys(page_size as i32)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| {
                    StorageError::request("list", bucket, prefix, DisplayErrorContext(&e).to_string())
                })?;

            objects.extend(response.contents().iter().filter_map(|obj| {
                obj.key().map(|key| ObjectMeta {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    size: obj.size().unwrap_or_default().max(0) as u64,
                })
            }));

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        objects.truncate(max_results);
        debug!(count = objects.len(), "Listed objects");
        Ok(objects)
    }

    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::request("put", bucket, key, DisplayErrorContext(&e).to_string()))?;

        debug!("Object uploaded");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        // S3 acknowledges deletes of absent keys, so NotFound is never surfaced here.
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                StorageError::request("delete", bucket, key, DisplayErrorContext(&e).to_string())
            })?;

        debug!("Object deleted");
        Ok(())
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn delete_batch(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> Result<BatchDeleteOutcome, StorageError> {
        if keys.is_empty() {
            return Ok(BatchDeleteOutcome::default());
        }
        if keys.len() > MAX_BATCH_DELETE_KEYS {
            return Err(StorageError::TooManyKeys {
                count: keys.len(),
                max: MAX_BATCH_DELETE_KEYS,
            });
        }

        let identifiers = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::request("delete_batch", bucket, "", e.to_string()))?;

        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .quiet(true)
            .build()
            .map_err(|e| StorageError::request("delete_batch", bucket, "", e.to_string()))?;

        let response = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| {
                StorageError::request("delete_batch", bucket, "", DisplayErrorContext(&e).to_string())
            })?;

        // Quiet mode only reports failures; everything else was deleted.
        let failed: Vec<(String, String)> = response
            .errors()
            .iter()
            .filter_map(|err| {
                err.key().map(|key| {
                    (
                        key.to_string(),
                        err.message().unwrap_or("unknown error").to_string(),
                    )
                })
            })
            .collect();

        let deleted = keys
            .iter()
            .filter(|key| !failed.iter().any(|(failed_key, _)| failed_key == *key))
            .cloned()
            .collect();

        Ok(BatchDeleteOutcome { deleted, failed })
    }
}
