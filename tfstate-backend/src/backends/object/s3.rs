//! S3 object store
//!
//! Locks with a conditional `PutObject` (`If-None-Match: *`) of the lock
//! marker. History comes from bucket versioning.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime as AwsDateTime};
use aws_sdk_s3::types::ServerSideEncryption;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{
    KeyLayout, LockStrategy, META_SERIAL, ObjectMeta, ObjectStorageBackend, ObjectStore,
    ObjectVersion, StoredObject,
};
use crate::backend::{BackendError, BackendResult};
use crate::config::BackendConfig;
use crate::pool::{ConnectionFactory, ConnectionPool, PooledConnection};
use crate::state::compute_checksum;

/// Number of most recent versions whose serial is read with a HEAD request
const VERSION_SERIAL_LOOKUPS: usize = 5;

pub struct S3ClientFactory {
    config: aws_sdk_s3::Config,
}

#[async_trait]
impl ConnectionFactory for S3ClientFactory {
    type Connection = Client;

    async fn connect(&self) -> BackendResult<Client> {
        Ok(Client::from_conf(self.config.clone()))
    }
}

/// S3-based object store
pub struct S3Store {
    pool: ConnectionPool<S3ClientFactory>,
    bucket: String,
    key: String,
    region: Option<String>,
    endpoint: Option<String>,
    /// Whether to encrypt the state file (default: true)
    encrypt: bool,
}

impl ObjectStorageBackend<S3Store> {
    /// Create a new S3 backend from configuration
    pub async fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let bucket = config.require_string("bucket")?.to_string();
        let key = config.require_string("key")?.to_string();
        let region = config.get_string("region").map(str::to_string);
        let endpoint = config.get_string("endpoint").map(str::to_string);
        let encrypt = config.get_bool_or("encrypt", true);
        let prefix = config.get_string("workspace_key_prefix").unwrap_or("env:");

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &region {
            loader = loader.region(aws_sdk_s3::config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let store = S3Store {
            pool: ConnectionPool::new(
                S3ClientFactory {
                    config: builder.build(),
                },
                config.pool.clone(),
            ),
            bucket,
            region,
            endpoint,
            encrypt,
            key: key.clone(),
        };
        Ok(Self::with_layout(store, KeyLayout::new(&key, prefix), config))
    }
}

impl S3Store {
    async fn client(&self) -> BackendResult<PooledConnection<S3ClientFactory>> {
        self.pool.get().await
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    async fn fetch(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> BackendResult<Option<StoredObject>> {
        let client = self.client().await?;
        let result = client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_version_id(version_id.map(str::to_string))
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) if is_not_found_error(&err) => return Ok(None),
            // S3 rejects malformed version IDs with 400
            Err(err) if version_id.is_some() && status_of(&err) == Some(400) => return Ok(None),
            Err(err) => return Err(map_sdk_error(err)),
        };

        let meta = ObjectMeta {
            size: output.content_length().unwrap_or_default().max(0) as u64,
            last_modified: to_chrono(output.last_modified()),
            metadata: to_btree(output.metadata()),
        };
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| BackendError::Io(format!("failed to read S3 object {}: {}", key, e)))?
            .into_bytes();
        Ok(Some(StoredObject { body, meta }))
    }

    async fn head_version(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> BackendResult<Option<ObjectMeta>> {
        let client = self.client().await?;
        match client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .set_version_id(version_id.map(str::to_string))
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectMeta {
                size: output.content_length().unwrap_or_default().max(0) as u64,
                last_modified: to_chrono(output.last_modified()),
                metadata: to_btree(output.metadata()),
            })),
            Err(err) if is_not_found_error(&err) => Ok(None),
            Err(err) => Err(map_sdk_error(err)),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn kind(&self) -> &'static str {
        "s3"
    }

    fn lock_strategy(&self) -> LockStrategy {
        LockStrategy::ConditionalCreate
    }

    fn describe(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::from([
            ("bucket".to_string(), self.bucket.clone()),
            ("key".to_string(), self.key.clone()),
            ("encrypt".to_string(), self.encrypt.to_string()),
        ]);
        if let Some(region) = &self.region {
            map.insert("region".to_string(), region.clone());
        }
        if let Some(endpoint) = &self.endpoint {
            map.insert("endpoint".to_string(), endpoint.clone());
        }
        map
    }

    async fn get(&self, key: &str) -> BackendResult<Option<StoredObject>> {
        self.fetch(key, None).await
    }

    async fn get_version(
        &self,
        key: &str,
        version_id: &str,
    ) -> BackendResult<Option<StoredObject>> {
        self.fetch(key, Some(version_id)).await
    }

    async fn head(&self, key: &str) -> BackendResult<Option<ObjectMeta>> {
        self.head_version(key, None).await
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: &BTreeMap<String, String>,
        _lease_id: Option<&str>,
    ) -> BackendResult<()> {
        let client = self.client().await?;
        let mut request = client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .checksum_sha256(compute_checksum(&body))
            .set_metadata(Some(metadata.clone().into_iter().collect::<HashMap<_, _>>()))
            .body(ByteStream::from(body))
            .content_type("application/json");

        if self.encrypt {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        request.send().await.map_err(map_sdk_error)?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, body: Bytes) -> BackendResult<bool> {
        let client = self.client().await?;
        let mut request = client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .body(ByteStream::from(body))
            .content_type("application/json");

        if self.encrypt {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        match request.send().await {
            Ok(_) => Ok(true),
            // 412: object exists; 409: a concurrent conditional write won
            Err(err) if matches!(status_of(&err), Some(409 | 412)) => Ok(false),
            Err(err) => Err(map_sdk_error(err)),
        }
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        let client = self.client().await?;
        client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> BackendResult<Vec<String>> {
        let client = self.client().await?;
        let mut keys = Vec::new();
        let mut token = None;

        loop {
            let output = client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token)
                .send()
                .await
                .map_err(map_sdk_error)?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_string)),
            );

            match output.next_continuation_token() {
                Some(next) if output.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string())
                }
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn list_versions(&self, key: &str) -> BackendResult<Vec<ObjectVersion>> {
        let output = {
            let client = self.client().await?;
            client
                .list_object_versions()
                .bucket(&self.bucket)
                .prefix(key)
                .send()
                .await
                .map_err(map_sdk_error)?
        };

        let mut versions: Vec<ObjectVersion> = output
            .versions()
            .iter()
            .filter(|v| v.key() == Some(key))
            .map(|v| ObjectVersion {
                version_id: v.version_id().unwrap_or("null").to_string(),
                size: v.size().unwrap_or_default().max(0) as u64,
                last_modified: to_chrono(v.last_modified()),
                is_latest: v.is_latest().unwrap_or(false),
                serial: None,
                checksum: v.e_tag().unwrap_or_default().trim_matches('"').to_string(),
            })
            .collect();
        versions.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));

        // Serial lives in object metadata, which the listing doesn't include
        for version in versions.iter_mut().take(VERSION_SERIAL_LOOKUPS) {
            if let Some(meta) = self.head_version(key, Some(&version.version_id)).await? {
                version.serial = meta.metadata.get(META_SERIAL).and_then(|s| s.parse().ok());
            }
        }
        Ok(versions)
    }

    async fn check_access(&self) -> BackendResult<()> {
        let client = self.client().await?;
        client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|err| {
                if is_not_found_error(&err) {
                    BackendError::configuration(format!("bucket {} does not exist", self.bucket))
                } else {
                    map_sdk_error(err)
                }
            })?;
        Ok(())
    }
}

fn to_chrono(time: Option<&AwsDateTime>) -> DateTime<Utc> {
    time.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

fn to_btree(metadata: Option<&HashMap<String, String>>) -> BTreeMap<String, String> {
    metadata
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn status_of<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

/// Check if an S3 error is a "not found" error
fn is_not_found_error<E>(err: &SdkError<E>) -> bool {
    status_of(err) == Some(404)
}

fn map_sdk_error<E>(err: SdkError<E>) -> BackendError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match (&err, status_of(&err)) {
        (SdkError::TimeoutError(_), _) => BackendError::Timeout(message),
        (_, Some(status @ (408 | 429 | 500..=599))) => BackendError::from_status(status, message),
        _ => BackendError::storage("S3", message),
    }
}
