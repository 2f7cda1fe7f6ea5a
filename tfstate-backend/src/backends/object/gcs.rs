//! Google Cloud Storage object store (JSON API)
//!
//! Every upload creates a new object generation; the lock is a `.tflock`
//! marker created with `ifGenerationMatch=0`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;

use super::{
    KeyLayout, LockStrategy, META_SERIAL, ObjectMeta, ObjectStorageBackend, ObjectStore,
    ObjectVersion, StoredObject,
};
use crate::backend::{BackendError, BackendResult};
use crate::backends::http::{HttpClientFactory, parse_http_date, status_error, transport_error};
use crate::config::BackendConfig;
use crate::pool::ConnectionPool;
use crate::state::compute_checksum;

const BACKEND: &str = "gcs";
const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
const DEFAULT_PREFIX: &str = "terraform/state";
const STATE_FILE: &str = "default.tfstate";
const TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
const META_CHECKSUM: &str = "checksum";

/// Object resource as returned by the JSON API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObject {
    name: String,
    #[serde(default)]
    size: String,
    #[serde(default)]
    generation: String,
    updated: Option<DateTime<Utc>>,
    time_deleted: Option<DateTime<Utc>>,
    md5_hash: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl GcsObject {
    fn meta(self) -> ObjectMeta {
        ObjectMeta {
            size: self.size.parse().unwrap_or_default(),
            last_modified: self.updated.unwrap_or_else(Utc::now),
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<GcsObject>,
    next_page_token: Option<String>,
}

/// Google Cloud Storage object store
pub struct GcsStore {
    pool: ConnectionPool<HttpClientFactory>,
    endpoint: Url,
    bucket: String,
    prefix: String,
    token: Option<String>,
}

impl ObjectStorageBackend<GcsStore> {
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let bucket = config.require_string("bucket")?.to_string();
        let prefix = config
            .get_string("prefix")
            .unwrap_or(DEFAULT_PREFIX)
            .trim_matches('/')
            .to_string();

        let token = config
            .get_string("access_token")
            .map(str::to_string)
            .or_else(|| std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty()));

        let endpoint = match config.get_string("endpoint") {
            Some(endpoint) => endpoint,
            None if token.is_none() => {
                return Err(BackendError::configuration(format!(
                    "Missing required attribute: access_token (or set {})",
                    TOKEN_ENV
                )));
            }
            None => DEFAULT_ENDPOINT,
        };
        let endpoint = Url::parse(endpoint).map_err(|e| {
            BackendError::configuration(format!("invalid endpoint {}: {}", endpoint, e))
        })?;

        let key = if prefix.is_empty() {
            STATE_FILE.to_string()
        } else {
            format!("{}/{}", prefix, STATE_FILE)
        };

        let store = GcsStore {
            pool: ConnectionPool::new(HttpClientFactory::default(), config.pool.clone()),
            endpoint,
            bucket,
            prefix,
            token,
        };
        Ok(Self::with_layout(store, KeyLayout::new(&key, "env:"), config))
    }
}

impl GcsStore {
    /// `storage/v1/b/<bucket>[/o[/<object>]]`, optionally under `upload/`
    fn url(
        &self,
        upload: bool,
        object: Option<&str>,
        query: &[(&str, &str)],
    ) -> BackendResult<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BackendError::configuration("endpoint cannot be a base URL"))?;
            segments.pop_if_empty();
            if upload {
                segments.push("upload");
            }
            segments.extend(["storage", "v1", "b", self.bucket.as_str()]);
            match object {
                // Object names are a single, fully encoded segment
                Some(name) => {
                    segments.push("o").push(name);
                }
                None if upload => {
                    segments.push("o");
                }
                None => {}
            }
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn list_url(&self, query: &[(&str, &str)]) -> BackendResult<Url> {
        let mut url = self.url(false, None, &[])?;
        url.path_segments_mut()
            .map_err(|_| BackendError::configuration("endpoint cannot be a base URL"))?
            .push("o");
        url.query_pairs_mut().extend_pairs(query);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> BackendResult<reqwest::Response> {
        let client = self.pool.get().await?;
        let mut request = client.request(method, url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        build(request)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))
    }

    async fn download(
        &self,
        key: &str,
        generation: Option<&str>,
    ) -> BackendResult<Option<StoredObject>> {
        let mut query = vec![("alt", "media")];
        if let Some(generation) = generation {
            query.push(("generation", generation));
        }
        let response = self
            .send(Method::GET, self.url(false, Some(key), &query)?, |r| r)
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::BAD_REQUEST if generation.is_some() => Ok(None),
            status if status.is_success() => {
                let headers = response.headers().clone();
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| transport_error(BACKEND, e))?;
                let meta = meta_from_headers(&headers, body.len() as u64);
                Ok(Some(StoredObject { body, meta }))
            }
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    /// Multipart upload of body and metadata; `Ok(false)` on a failed precondition
    async fn upload(
        &self,
        key: &str,
        body: Bytes,
        metadata: &BTreeMap<String, String>,
        if_generation_match: Option<&str>,
    ) -> BackendResult<bool> {
        let mut query = vec![("uploadType", "multipart")];
        if let Some(generation) = if_generation_match {
            query.push(("ifGenerationMatch", generation));
        }

        let resource = serde_json::json!({
            "name": key,
            "contentType": "application/json",
            "metadata": metadata,
        });
        let boundary = format!("tfstate-{}", uuid::Uuid::new_v4().simple());
        let payload = multipart_related(&boundary, &resource, &body);

        let response = self
            .send(Method::POST, self.url(true, None, &query)?, |r| {
                r.header(
                    "content-type",
                    format!("multipart/related; boundary={}", boundary),
                )
                .body(payload)
            })
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::PRECONDITION_FAILED if if_generation_match.is_some() => Ok(false),
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    async fn list_objects(&self, prefix: &str, versions: bool) -> BackendResult<Vec<GcsObject>> {
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("prefix", prefix)];
            if versions {
                query.push(("versions", "true"));
            }
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let response = self
                .send(Method::GET, self.list_url(&query)?, |r| r)
                .await?;
            if !response.status().is_success() {
                return Err(status_error(BACKEND, response).await);
            }
            let page: ObjectList = response.json().await.map_err(|e| {
                BackendError::Serialization(format!("Failed to parse object listing: {}", e))
            })?;

            objects.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(objects)
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    fn kind(&self) -> &'static str {
        BACKEND
    }

    fn lock_strategy(&self) -> LockStrategy {
        LockStrategy::ConditionalCreate
    }

    fn describe(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("bucket".to_string(), self.bucket.clone()),
            ("prefix".to_string(), self.prefix.clone()),
            ("endpoint".to_string(), self.endpoint.to_string()),
        ])
    }

    async fn get(&self, key: &str) -> BackendResult<Option<StoredObject>> {
        self.download(key, None).await
    }

    async fn get_version(
        &self,
        key: &str,
        version_id: &str,
    ) -> BackendResult<Option<StoredObject>> {
        if version_id.parse::<i64>().is_err() {
            return Ok(None);
        }
        self.download(key, Some(version_id)).await
    }

    async fn head(&self, key: &str) -> BackendResult<Option<ObjectMeta>> {
        let response = self
            .send(Method::GET, self.url(false, Some(key), &[])?, |r| r)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let object: GcsObject = response.json().await.map_err(|e| {
                    BackendError::Serialization(format!("Failed to parse object resource: {}", e))
                })?;
                Ok(Some(object.meta()))
            }
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: &BTreeMap<String, String>,
        _lease_id: Option<&str>,
    ) -> BackendResult<()> {
        let mut metadata = metadata.clone();
        metadata.insert(META_CHECKSUM.to_string(), compute_checksum(&body));
        self.upload(key, body, &metadata, None).await.map(|_| ())
    }

    async fn put_if_absent(&self, key: &str, body: Bytes) -> BackendResult<bool> {
        self.upload(key, body, &BTreeMap::new(), Some("0")).await
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        let response = self
            .send(Method::DELETE, self.url(false, Some(key), &[])?, |r| r)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    async fn list(&self, prefix: &str) -> BackendResult<Vec<String>> {
        Ok(self
            .list_objects(prefix, false)
            .await?
            .into_iter()
            .map(|object| object.name)
            .collect())
    }

    async fn list_versions(&self, key: &str) -> BackendResult<Vec<ObjectVersion>> {
        let mut versions: Vec<(i64, ObjectVersion)> = self
            .list_objects(key, true)
            .await?
            .into_iter()
            .filter(|object| object.name == key)
            .filter_map(|object| {
                let generation = object.generation.parse::<i64>().ok()?;
                let checksum = object
                    .metadata
                    .get(META_CHECKSUM)
                    .cloned()
                    .or(object.md5_hash.clone())
                    .unwrap_or_default();
                let version = ObjectVersion {
                    version_id: object.generation.clone(),
                    size: object.size.parse().unwrap_or_default(),
                    last_modified: object.updated.unwrap_or_else(Utc::now),
                    is_latest: object.time_deleted.is_none(),
                    serial: object.metadata.get(META_SERIAL).and_then(|s| s.parse().ok()),
                    checksum,
                };
                Some((generation, version))
            })
            .collect();

        versions.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(versions.into_iter().map(|(_, version)| version).collect())
    }

    async fn check_access(&self) -> BackendResult<()> {
        let response = self
            .send(Method::GET, self.url(false, None, &[])?, |r| r)
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(BackendError::configuration(format!(
                "bucket {} does not exist",
                self.bucket
            ))),
            _ => Err(status_error(BACKEND, response).await),
        }
    }
}

fn meta_from_headers(headers: &HeaderMap, size: u64) -> ObjectMeta {
    let metadata = headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix("x-goog-meta-")?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();
    ObjectMeta {
        size,
        last_modified: headers
            .get("last-modified")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date)
            .unwrap_or_else(Utc::now),
        metadata,
    }
}

/// `multipart/related` body: the object resource, then the media
fn multipart_related(boundary: &str, resource: &serde_json::Value, body: &[u8]) -> Bytes {
    let mut payload = BytesMut::new();
    payload.put_slice(format!("--{}\r\n", boundary).as_bytes());
    payload.put_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    payload.put_slice(resource.to_string().as_bytes());
    payload.put_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    payload.put_slice(b"Content-Type: application/json\r\n\r\n");
    payload.put_slice(body);
    payload.put_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    payload.freeze()
}
