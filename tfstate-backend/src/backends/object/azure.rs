//! Azure blob storage object store (Blob service REST API)
//!
//! Locks with a blob lease on the state blob itself and records history as
//! blob snapshots taken after every upload.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use regex::Regex;
use reqwest::header::HeaderMap;
use reqwest::{Method, RequestBuilder, StatusCode, Url};

use super::{
    KeyLayout, LockStrategy, META_SERIAL, ObjectMeta, ObjectStorageBackend, ObjectStore,
    ObjectVersion, StoredObject,
};
use crate::backend::{BackendError, BackendResult};
use crate::backends::http::{HttpClientFactory, parse_http_date, status_error, transport_error};
use crate::config::BackendConfig;
use crate::pool::ConnectionPool;
use crate::state::compute_checksum;

const API_VERSION: &str = "2021-08-06";
const BACKEND: &str = "azurerm";
const META_CHECKSUM: &str = "checksum";
const META_HEADER_PREFIX: &str = "x-ms-meta-";

#[derive(Clone)]
enum Credentials {
    /// Shared access signature appended to every URL
    Sas(String),
    Bearer(String),
}

/// Blob storage object store
pub struct AzureBlobStore {
    pool: ConnectionPool<HttpClientFactory>,
    endpoint: Url,
    account: String,
    container: String,
    key: String,
    credentials: Credentials,
}

impl ObjectStorageBackend<AzureBlobStore> {
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let account = config.require_string("storage_account_name")?.to_string();
        let container = config.require_string("container_name")?.to_string();
        let key = config.require_string("key")?.to_string();

        let credentials = match (
            config.get_string("sas_token"),
            config.get_string("access_token"),
        ) {
            (Some(sas), _) => Credentials::Sas(sas.trim_start_matches('?').to_string()),
            (None, Some(token)) => Credentials::Bearer(token.to_string()),
            (None, None) => {
                return Err(BackendError::configuration(
                    "Missing required attribute: sas_token or access_token",
                ));
            }
        };

        let endpoint = match config.get_string("endpoint") {
            Some(endpoint) => endpoint.to_string(),
            None => format!("https://{}.blob.core.windows.net", account),
        };
        let endpoint = Url::parse(&endpoint).map_err(|e| {
            BackendError::configuration(format!("invalid endpoint {}: {}", endpoint, e))
        })?;

        let store = AzureBlobStore {
            pool: ConnectionPool::new(HttpClientFactory::default(), config.pool.clone()),
            endpoint,
            account,
            container,
            key: key.clone(),
            credentials,
        };
        Ok(Self::with_layout(store, KeyLayout::new(&key, "env:"), config))
    }
}

impl AzureBlobStore {
    fn url(&self, blob: Option<&str>, query: &[(&str, &str)]) -> BackendResult<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BackendError::configuration("endpoint cannot be a base URL"))?;
            segments.pop_if_empty().push(&self.container);
            if let Some(blob) = blob {
                segments.extend(blob.split('/'));
            }
        }

        if let Credentials::Sas(sas) = &self.credentials {
            url.set_query(Some(sas));
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> BackendResult<reqwest::Response> {
        let client = self.pool.get().await?;
        let mut request = client
            .request(method, url)
            .header("x-ms-version", API_VERSION);
        if let Credentials::Bearer(token) = &self.credentials {
            request = request.bearer_auth(token);
        }
        build(request)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))
    }

    async fn fetch(
        &self,
        key: &str,
        snapshot: Option<&str>,
    ) -> BackendResult<Option<StoredObject>> {
        let query: Vec<(&str, &str)> = snapshot.map(|s| ("snapshot", s)).into_iter().collect();
        let response = self
            .send(Method::GET, self.url(Some(key), &query)?, |r| r)
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::BAD_REQUEST if snapshot.is_some() => Ok(None),
            status if status.is_success() => {
                let meta = meta_from_headers(response.headers());
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| transport_error(BACKEND, e))?;
                Ok(Some(StoredObject { body, meta }))
            }
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    async fn lease(
        &self,
        key: &str,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> BackendResult<reqwest::Response> {
        self.send(Method::PUT, self.url(Some(key), &[("comp", "lease")])?, build)
            .await
    }

    /// List container blobs under `prefix`, returning each `<Blob>` element
    async fn list_blobs(&self, prefix: &str, include: Option<&str>) -> BackendResult<Vec<String>> {
        let mut blobs = Vec::new();
        let mut marker = String::new();

        loop {
            let mut query = vec![("restype", "container"), ("comp", "list"), ("prefix", prefix)];
            if let Some(include) = include {
                query.push(("include", include));
            }
            if !marker.is_empty() {
                query.push(("marker", marker.as_str()));
            }

            let response = self
                .send(Method::GET, self.url(None, &query)?, |r| r)
                .await?;
            if !response.status().is_success() {
                return Err(status_error(BACKEND, response).await);
            }
            let xml = response
                .text()
                .await
                .map_err(|e| transport_error(BACKEND, e))?;

            blobs.extend(elements(&xml, "Blob").into_iter().map(str::to_string));
            match element(&xml, "NextMarker") {
                Some(next) if !next.is_empty() => marker = next.to_string(),
                _ => break,
            }
        }
        Ok(blobs)
    }
}

#[async_trait]
impl ObjectStore for AzureBlobStore {
    fn kind(&self) -> &'static str {
        BACKEND
    }

    fn lock_strategy(&self) -> LockStrategy {
        LockStrategy::Lease
    }

    fn describe(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("storage_account_name".to_string(), self.account.clone()),
            ("container_name".to_string(), self.container.clone()),
            ("key".to_string(), self.key.clone()),
            ("endpoint".to_string(), self.endpoint.to_string()),
        ])
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
        let response = self
            .send(Method::HEAD, self.url(Some(key), &[])?, |r| r)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(meta_from_headers(response.headers()))),
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: &BTreeMap<String, String>,
        lease_id: Option<&str>,
    ) -> BackendResult<()> {
        let mut metadata = metadata.clone();
        metadata.insert(META_CHECKSUM.to_string(), compute_checksum(&body));

        let response = self
            .send(Method::PUT, self.url(Some(key), &[])?, |mut r| {
                r = r
                    .header("x-ms-blob-type", "BlockBlob")
                    .header("content-type", "application/json");
                for (k, v) in &metadata {
                    r = r.header(format!("{}{}", META_HEADER_PREFIX, k), v);
                }
                if let Some(lease_id) = lease_id {
                    r = r.header("x-ms-lease-id", lease_id);
                }
                r.body(body)
            })
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(status_error(BACKEND, response).await);
        }

        let snapshot = self
            .send(Method::PUT, self.url(Some(key), &[("comp", "snapshot")])?, |r| match lease_id {
                Some(lease_id) => r.header("x-ms-lease-id", lease_id),
                None => r,
            })
            .await?;
        if snapshot.status() != StatusCode::CREATED {
            let err = status_error(BACKEND, snapshot).await;
            log::warn!("state written to {} but snapshot failed: {}", key, err);
        }
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, body: Bytes) -> BackendResult<bool> {
        let response = self
            .send(Method::PUT, self.url(Some(key), &[])?, |r| {
                r.header("x-ms-blob-type", "BlockBlob")
                    .header("if-none-match", "*")
                    .body(body)
            })
            .await?;
        match response.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Ok(false),
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        let response = self
            .send(Method::DELETE, self.url(Some(key), &[])?, |r| {
                r.header("x-ms-delete-snapshots", "include")
            })
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    async fn list(&self, prefix: &str) -> BackendResult<Vec<String>> {
        Ok(self
            .list_blobs(prefix, None)
            .await?
            .iter()
            .filter_map(|blob| element(blob, "Name").map(unescape))
            .collect())
    }

    async fn list_versions(&self, key: &str) -> BackendResult<Vec<ObjectVersion>> {
        let blobs = self.list_blobs(key, Some("snapshots,metadata")).await?;

        let mut versions: Vec<ObjectVersion> = blobs
            .iter()
            .filter(|blob| element(blob, "Name").map(unescape).as_deref() == Some(key))
            .filter_map(|blob| {
                let snapshot = element(blob, "Snapshot")?;
                Some(ObjectVersion {
                    version_id: snapshot.to_string(),
                    size: element(blob, "Content-Length")
                        .and_then(|s| s.parse().ok())
                        .unwrap_or_default(),
                    last_modified: element(blob, "Last-Modified")
                        .and_then(parse_http_date)
                        .unwrap_or_else(Utc::now),
                    is_latest: false,
                    serial: element(blob, META_SERIAL).and_then(|s| s.parse().ok()),
                    checksum: element(blob, META_CHECKSUM).unwrap_or_default().to_string(),
                })
            })
            .collect();

        // Snapshot IDs are timestamps, so the greatest is the newest
        versions.sort_by(|a, b| b.version_id.cmp(&a.version_id));
        if let Some(newest) = versions.first_mut() {
            newest.is_latest = true;
        }
        Ok(versions)
    }

    async fn check_access(&self) -> BackendResult<()> {
        let response = self
            .send(Method::GET, self.url(None, &[("restype", "container")])?, |r| r)
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(BackendError::configuration(format!(
                "container {} does not exist in {}",
                self.container, self.account
            ))),
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    fn lease_duration(&self, requested: Duration) -> Duration {
        // The service accepts 15 to 60 seconds
        Duration::from_secs(requested.as_secs().clamp(15, 60))
    }

    async fn acquire_lease(
        &self,
        key: &str,
        duration: Duration,
        lease_id: &str,
    ) -> BackendResult<Option<String>> {
        let seconds = self.lease_duration(duration).as_secs().to_string();
        let response = self
            .lease(key, |r| {
                r.header("x-ms-lease-action", "acquire")
                    .header("x-ms-lease-duration", seconds)
                    .header("x-ms-proposed-lease-id", lease_id)
            })
            .await?;

        match response.status() {
            StatusCode::CREATED => Ok(Some(
                response
                    .headers()
                    .get("x-ms-lease-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or(lease_id)
                    .to_string(),
            )),
            StatusCode::CONFLICT => Ok(None),
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    async fn renew_lease(&self, key: &str, lease_id: &str) -> BackendResult<()> {
        let response = self
            .lease(key, |r| {
                r.header("x-ms-lease-action", "renew")
                    .header("x-ms-lease-id", lease_id)
            })
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(BACKEND, response).await)
        }
    }

    async fn release_lease(&self, key: &str, lease_id: &str) -> BackendResult<()> {
        let response = self
            .lease(key, |r| {
                r.header("x-ms-lease-action", "release")
                    .header("x-ms-lease-id", lease_id)
            })
            .await?;
        if response.status().is_success() {
            return Ok(());
        }

        let code = response
            .headers()
            .get("x-ms-error-code")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        match code.as_str() {
            "LeaseNotPresentWithLeaseOperation" => {
                Err(BackendError::LockNotFound(format!("no lease held on {}", key)))
            }
            "LeaseIdMismatchWithLeaseOperation" => Err(BackendError::LockMismatch {
                expected: "the active lease".to_string(),
                actual: lease_id.to_string(),
            }),
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    async fn set_metadata(
        &self,
        key: &str,
        metadata: &BTreeMap<String, String>,
        lease_id: Option<&str>,
    ) -> BackendResult<()> {
        let response = self
            .send(Method::PUT, self.url(Some(key), &[("comp", "metadata")])?, |mut r| {
                for (k, v) in metadata {
                    r = r.header(format!("{}{}", META_HEADER_PREFIX, k), v);
                }
                if let Some(lease_id) = lease_id {
                    r = r.header("x-ms-lease-id", lease_id);
                }
                r
            })
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(BACKEND, response).await)
        }
    }
}

fn meta_from_headers(headers: &HeaderMap) -> ObjectMeta {
    let metadata = headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(META_HEADER_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();

    ObjectMeta {
        size: headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or_default(),
        last_modified: headers
            .get("last-modified")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date)
            .unwrap_or_else(Utc::now),
        metadata,
    }
}

/// Contents of the first `<tag>` element
fn element<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let pattern = Regex::new(&format!(r"(?s)<{0}>(.*?)</{0}>", regex::escape(tag))).ok()?;
    pattern
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Contents of every `<tag>` element
fn elements<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let Ok(pattern) = Regex::new(&format!(r"(?s)<{0}>(.*?)</{0}>", regex::escape(tag))) else {
        return Vec::new();
    };
    pattern
        .captures_iter(xml)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StateBackend;
    use crate::lock::LockInfo;
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LIST_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ContainerName="tfstate">
  <Blobs>
    <Blob>
      <Name>terraform.tfstate</Name>
      <Snapshot>2024-05-01T10:00:00.0000000Z</Snapshot>
      <Properties>
        <Last-Modified>Wed, 01 May 2024 10:00:00 GMT</Last-Modified>
        <Content-Length>120</Content-Length>
      </Properties>
      <Metadata><serial>1</serial><checksum>abc</checksum></Metadata>
    </Blob>
    <Blob>
      <Name>terraform.tfstate</Name>
      <Snapshot>2024-05-02T10:00:00.0000000Z</Snapshot>
      <Properties>
        <Last-Modified>Thu, 02 May 2024 10:00:00 GMT</Last-Modified>
        <Content-Length>140</Content-Length>
      </Properties>
      <Metadata><serial>2</serial></Metadata>
    </Blob>
    <Blob>
      <Name>terraform.tfstate</Name>
      <Properties>
        <Last-Modified>Thu, 02 May 2024 10:00:00 GMT</Last-Modified>
        <Content-Length>140</Content-Length>
      </Properties>
    </Blob>
    <Blob>
      <Name>env:/staging/terraform.tfstate</Name>
    </Blob>
  </Blobs>
  <NextMarker />
</EnumerationResults>"#;

    fn backend(server: &MockServer) -> ObjectStorageBackend<AzureBlobStore> {
        let config = BackendConfig::new("azurerm")
            .with_attribute("storage_account_name", "acct")
            .with_attribute("container_name", "tfstate")
            .with_attribute("key", "terraform.tfstate")
            .with_attribute("sas_token", "?sv=2022-11-02&sig=secret")
            .with_attribute("endpoint", server.uri());
        ObjectStorageBackend::<AzureBlobStore>::from_config(&config).unwrap()
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let config = BackendConfig::new("azurerm")
            .with_attribute("storage_account_name", "acct")
            .with_attribute("container_name", "tfstate")
            .with_attribute("key", "terraform.tfstate");
        let err = ObjectStorageBackend::<AzureBlobStore>::from_config(&config)
            .err()
            .unwrap();
        assert!(matches!(err, BackendError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_lease_duration_is_clamped() {
        let server = MockServer::start().await;
        let backend = backend(&server);
        let store = backend.store();
        assert_eq!(store.lease_duration(Duration::from_secs(120)), Duration::from_secs(60));
        assert_eq!(store.lease_duration(Duration::from_secs(5)), Duration::from_secs(15));
        assert_eq!(store.lease_duration(Duration::from_secs(30)), Duration::from_secs(30));
    }

    #[test]
    fn test_xml_helpers() {
        let blobs = elements(LIST_XML, "Blob");
        assert_eq!(blobs.len(), 4);
        assert_eq!(element(blobs[0], "serial"), Some("1"));
        assert_eq!(unescape("a&amp;b&lt;c"), "a&b<c");
    }

    #[tokio::test]
    async fn test_pull_missing_blob_is_empty_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tfstate/terraform.tfstate"))
            .and(query_param("sig", "secret"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let state = backend(&server).pull().await.unwrap();
        assert_eq!(state.serial, 0);
        assert_eq!(state.version, 4);
    }

    #[tokio::test]
    async fn test_lock_acquires_lease_and_records_holder() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/tfstate/terraform.tfstate"))
            .respond_with(ResponseTemplate::new(200).insert_header("x-ms-meta-serial", "3"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(query_param("comp", "lease"))
            .and(header("x-ms-lease-action", "acquire"))
            .and(header("x-ms-lease-duration", "60"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-ms-lease-id", "6f1e1a5c-0000-4000-8000-000000000001"),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(query_param("comp", "metadata"))
            .and(header("x-ms-meta-serial", "3"))
            .and(header("x-ms-lease-id", "6f1e1a5c-0000-4000-8000-000000000001"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend(&server);
        let id = backend
            .lock(&LockInfo::new("apply").with_who("alice@ci"))
            .await
            .unwrap();
        assert_eq!(id, "6f1e1a5c-0000-4000-8000-000000000001");
        assert_eq!(backend.get_lock_info().await.unwrap().who, "alice@ci");
    }

    #[tokio::test]
    async fn test_lock_conflict_names_holder() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/tfstate/terraform.tfstate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-ms-meta-lock_id", "held-1")
                    .insert_header("x-ms-meta-lock_who", "bob@laptop")
                    .insert_header("x-ms-meta-lock_operation", "apply")
                    .insert_header("x-ms-meta-lock_created", "2024-05-01T10:00:00+00:00"),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(query_param("comp", "lease"))
            .respond_with(
                ResponseTemplate::new(409).insert_header("x-ms-error-code", "LeaseAlreadyPresent"),
            )
            .mount(&server)
            .await;

        match backend(&server).lock(&LockInfo::new("plan")).await {
            Err(BackendError::Locked { who, lock_id, .. }) => {
                assert_eq!(who, "bob@laptop");
                assert_eq!(lock_id, "held-1");
            }
            other => panic!("expected Locked, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_push_uploads_with_metadata_and_snapshots() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tfstate/terraform.tfstate"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/tfstate/terraform.tfstate"))
            .and(query_param_is_missing("comp"))
            .and(header("x-ms-blob-type", "BlockBlob"))
            .and(header("x-ms-meta-serial", "1"))
            .and(header("x-ms-meta-lineage", "L1"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(query_param("comp", "snapshot"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let mut state = crate::state::StateData::with_lineage("L1");
        state.serial = 1;
        state.data.clear();
        backend(&server).push(&state).await.unwrap();
    }

    #[tokio::test]
    async fn test_versions_and_workspaces_from_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tfstate"))
            .and(query_param("comp", "list"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LIST_XML))
            .mount(&server)
            .await;

        let backend = backend(&server);
        let versions = backend.get_versions().await.unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[0].is_latest);
        assert_eq!(versions[0].serial, 2);
        assert_eq!(versions[1].checksum, "abc");

        let workspaces = backend.list_workspaces().await.unwrap();
        assert_eq!(workspaces, vec!["default", "staging"]);
    }
}
