//! Remote state-management service backend (Terraform Cloud API)
//!
//! State lives in immutable state-version resources under
//! organization → workspace. The service serializes writers itself, so
//! `lock` and `unlock` only hand out and accept synthetic lock ids.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::backend::{
    BackendError, BackendMetadata, BackendResult, StateBackend, check_create_workspace,
    check_delete_workspace, check_select_workspace,
};
use crate::backends::http::{HttpClientFactory, status_error, transport_error};
use crate::config::BackendConfig;
use crate::lock::LockInfo;
use crate::pool::ConnectionPool;
use crate::state::{StateData, StateVersion, normalize_versions};

const BACKEND: &str = "remote";
const DEFAULT_HOSTNAME: &str = "app.terraform.io";
const JSON_API: &str = "application/vnd.api+json";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Deserialize)]
struct Document<T> {
    data: T,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Pagination {
    next_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Resource<A> {
    id: String,
    attributes: A,
}

#[derive(Debug, Deserialize)]
struct WorkspaceAttributes {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct StateVersionAttributes {
    serial: u64,
    created_at: Option<DateTime<Utc>>,
    size: Option<u64>,
    md5: Option<String>,
    hosted_state_download_url: Option<String>,
}

struct RemoteState {
    workspace: String,
}

/// Remote state-management service backend
pub struct RemoteBackend {
    pool: ConnectionPool<HttpClientFactory>,
    base_url: Url,
    hostname: String,
    organization: String,
    /// Workspace named in the configuration
    configured_workspace: String,
    token: String,
    state: RwLock<RemoteState>,
    /// Workspace name to service id
    workspace_ids: parking_lot::Mutex<HashMap<String, String>>,
}

impl RemoteBackend {
    /// Build the backend, checking the organization unless `skip_validation` is set
    pub async fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let organization = config.require_string("organization")?.to_string();
        let workspace = config.require_string("workspace")?.to_string();
        let token = config.require_string("token")?.to_string();
        let hostname = config
            .get_string("hostname")
            .unwrap_or(DEFAULT_HOSTNAME)
            .to_string();

        let address = match config.get_string("address") {
            Some(address) => address.trim_end_matches('/').to_string(),
            None => format!("https://{}", hostname),
        };
        let base_url = Url::parse(&format!("{}/api/v2", address)).map_err(|e| {
            BackendError::configuration(format!("invalid address {}: {}", address, e))
        })?;

        let backend = Self {
            pool: ConnectionPool::new(HttpClientFactory::default(), config.pool.clone()),
            base_url,
            hostname,
            organization,
            configured_workspace: workspace.clone(),
            token,
            state: RwLock::new(RemoteState { workspace }),
            workspace_ids: parking_lot::Mutex::new(HashMap::new()),
        };

        if !config.get_bool_or("skip_validation", false) {
            backend.validate().await?;
        }
        Ok(backend)
    }

    fn url(&self, segments: &[&str]) -> BackendResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::configuration("address cannot be a base URL"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> BackendResult<reqwest::Response> {
        let client = self.pool.get().await?;
        let request = client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("accept", JSON_API);
        build(request)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))
    }

    async fn json<T: DeserializeOwned>(response: reqwest::Response) -> BackendResult<T> {
        response.json().await.map_err(|e| {
            BackendError::Serialization(format!("Failed to parse {} response: {}", BACKEND, e))
        })
    }

    /// Service id of the named workspace; `None` when it does not exist
    async fn lookup_workspace(&self, name: &str) -> BackendResult<Option<String>> {
        if let Some(id) = self.workspace_ids.lock().get(name) {
            return Ok(Some(id.clone()));
        }

        let url = self.url(&["organizations", self.organization.as_str(), "workspaces", name])?;
        let response = self.send(Method::GET, url, |r| r).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::OK => {
                let doc: Document<Resource<WorkspaceAttributes>> = Self::json(response).await?;
                self.workspace_ids
                    .lock()
                    .insert(name.to_string(), doc.data.id.clone());
                Ok(Some(doc.data.id))
            }
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    async fn workspace_id(&self, name: &str) -> BackendResult<String> {
        self.lookup_workspace(name)
            .await?
            .ok_or_else(|| BackendError::WorkspaceNotFound(name.to_string()))
    }

    async fn download(
        &self,
        version: &Resource<StateVersionAttributes>,
    ) -> BackendResult<StateData> {
        let url = match &version.attributes.hosted_state_download_url {
            Some(url) => Url::parse(url).map_err(|e| {
                BackendError::storage(BACKEND, format!("invalid download URL {}: {}", url, e))
            })?,
            None => self.url(&["state-versions", version.id.as_str(), "download"])?,
        };

        let response = self.send(Method::GET, url, |r| r).await?;
        if response.status() != StatusCode::OK {
            return Err(status_error(BACKEND, response).await);
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        let created = version.attributes.created_at.unwrap_or_else(Utc::now);
        StateData::from_bytes(body.to_vec(), created)
    }

    async fn pull_workspace(&self, workspace: &str) -> BackendResult<StateData> {
        let id = self.workspace_id(workspace).await?;
        let url = self.url(&["workspaces", id.as_str(), "current-state-version"])?;
        let response = self.send(Method::GET, url, |r| r).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(StateData::empty()),
            StatusCode::OK => {
                let doc: Document<Resource<StateVersionAttributes>> = Self::json(response).await?;
                self.download(&doc.data).await
            }
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    /// Every page of a JSON:API collection
    async fn list_all<A: DeserializeOwned>(
        &self,
        segments: &[&str],
    ) -> BackendResult<Vec<Resource<A>>> {
        let mut resources = Vec::new();
        let mut page = 1u32;
        loop {
            let mut url = self.url(segments)?;
            url.query_pairs_mut()
                .append_pair("page[number]", &page.to_string())
                .append_pair("page[size]", PAGE_SIZE);

            let response = self.send(Method::GET, url, |r| r).await?;
            if response.status() != StatusCode::OK {
                return Err(status_error(BACKEND, response).await);
            }
            let doc: Document<Vec<Resource<A>>> = Self::json(response).await?;
            resources.extend(doc.data);

            match doc.meta.and_then(|m| m.pagination).and_then(|p| p.next_page) {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }
        Ok(resources)
    }
}

fn wrap(err: BackendError, action: &str) -> BackendError {
    match err {
        BackendError::Storage { backend, message } => BackendError::Storage {
            message: format!("failed to {}: {}", action, message),
            backend,
        },
        BackendError::Http { status, message } => BackendError::Http {
            status,
            message: format!("failed to {}: {}", action, message),
        },
        other => other,
    }
}

#[async_trait]
impl StateBackend for RemoteBackend {
    async fn pull(&self) -> BackendResult<StateData> {
        let state = self.state.read().await;
        self.pull_workspace(&state.workspace)
            .await
            .map_err(|e| wrap(e, "pull state"))
    }

    async fn push(&self, data: &StateData) -> BackendResult<()> {
        let state = self.state.write().await;
        let body = data.encode()?;
        let id = self.workspace_id(&state.workspace).await?;

        let payload = serde_json::json!({
            "data": {
                "type": "state-versions",
                "attributes": {
                    "serial": data.serial,
                    "lineage": data.lineage,
                },
                "relationships": {
                    "workspace": {
                        "data": { "type": "workspaces", "id": id }
                    }
                }
            }
        });
        let response = self
            .send(Method::POST, self.url(&["state-versions"])?, |r| {
                r.header("content-type", JSON_API).body(payload.to_string())
            })
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(wrap(
                status_error(BACKEND, response).await,
                "create state version",
            ));
        }
        let created: Document<Resource<serde_json::Value>> = Self::json(response).await?;

        let url = self.url(&["state-versions", created.data.id.as_str(), "upload"])?;
        let response = self
            .send(Method::PUT, url, |r| {
                r.header("content-type", "application/json").body(body)
            })
            .await?;
        if !response.status().is_success() {
            return Err(wrap(
                status_error(BACKEND, response).await,
                "upload state data",
            ));
        }
        log::debug!(
            "pushed state version {} (serial {}) to workspace {}",
            created.data.id,
            data.serial,
            state.workspace
        );
        Ok(())
    }

    async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        let _state = self.state.write().await;
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let id = format!("tc-lock-{}", nanos);
        log::debug!(
            "{} locks are enforced by the service, issuing {} for {}",
            BACKEND,
            id,
            info.operation
        );
        Ok(id)
    }

    async fn unlock(&self, _lock_id: &str) -> BackendResult<()> {
        let _state = self.state.write().await;
        Ok(())
    }

    async fn get_versions(&self) -> BackendResult<Vec<StateVersion>> {
        let state = self.state.read().await;
        let id = self.workspace_id(&state.workspace).await?;
        let resources: Vec<Resource<StateVersionAttributes>> = self
            .list_all(&["workspaces", id.as_str(), "state-versions"])
            .await
            .map_err(|e| wrap(e, "list state versions"))?;

        // The service lists newest first
        Ok(normalize_versions(
            resources
                .into_iter()
                .enumerate()
                .map(|(i, r)| StateVersion {
                    id: r.id.clone(),
                    version_id: r.id,
                    serial: r.attributes.serial,
                    created: r.attributes.created_at.unwrap_or_else(Utc::now),
                    size: r.attributes.size.unwrap_or_default(),
                    checksum: r.attributes.md5.unwrap_or_default(),
                    is_latest: i == 0,
                    description: None,
                })
                .collect(),
        ))
    }

    async fn get_version(&self, version_id: &str) -> BackendResult<StateData> {
        if version_id.is_empty() || version_id == "current" {
            return self.pull().await;
        }

        let _state = self.state.read().await;
        let response = self
            .send(Method::GET, self.url(&["state-versions", version_id])?, |r| r)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(BackendError::VersionNotFound(version_id.to_string())),
            StatusCode::OK => {
                let doc: Document<Resource<StateVersionAttributes>> = Self::json(response).await?;
                self.download(&doc.data).await
            }
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    async fn list_workspaces(&self) -> BackendResult<Vec<String>> {
        let _state = self.state.read().await;
        let resources: Vec<Resource<WorkspaceAttributes>> = self
            .list_all(&["organizations", self.organization.as_str(), "workspaces"])
            .await
            .map_err(|e| wrap(e, "list workspaces"))?;

        let mut ids = self.workspace_ids.lock();
        let mut names: Vec<String> = resources
            .into_iter()
            .map(|r| {
                ids.insert(r.attributes.name.clone(), r.id);
                r.attributes.name
            })
            .collect();
        names.sort();
        Ok(names)
    }

    async fn select_workspace(&self, name: &str) -> BackendResult<()> {
        let mut state = self.state.write().await;
        let name = if name.is_empty() {
            self.configured_workspace.as_str()
        } else {
            name
        };
        check_select_workspace(name)?;
        self.workspace_id(name).await?;
        state.workspace = name.to_string();
        Ok(())
    }

    async fn create_workspace(&self, name: &str) -> BackendResult<()> {
        check_create_workspace(name)?;
        let _state = self.state.write().await;

        let payload = serde_json::json!({
            "data": {
                "type": "workspaces",
                "attributes": { "name": name },
                "relationships": {
                    "organization": {
                        "data": { "type": "organizations", "id": self.organization }
                    }
                }
            }
        });
        let url = self.url(&["organizations", self.organization.as_str(), "workspaces"])?;
        let response = self
            .send(Method::POST, url, |r| {
                r.header("content-type", JSON_API).body(payload.to_string())
            })
            .await?;

        match response.status() {
            StatusCode::CREATED => {
                let doc: Document<Resource<WorkspaceAttributes>> = Self::json(response).await?;
                self.workspace_ids
                    .lock()
                    .insert(doc.data.attributes.name, doc.data.id);
                log::info!("created workspace {}", name);
                Ok(())
            }
            // The service reports a taken name as a validation failure
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(BackendError::WorkspaceExists(name.to_string()))
            }
            _ => Err(wrap(status_error(BACKEND, response).await, "create workspace")),
        }
    }

    async fn delete_workspace(&self, name: &str) -> BackendResult<()> {
        let state = self.state.write().await;
        check_delete_workspace(name, &state.workspace)?;
        if name == self.configured_workspace {
            return Err(BackendError::CurrentWorkspace(name.to_string()));
        }

        let id = self.workspace_id(name).await?;
        let response = self
            .send(Method::DELETE, self.url(&["workspaces", id.as_str()])?, |r| r)
            .await?;
        match response.status() {
            status if status.is_success() => {
                self.workspace_ids.lock().remove(name);
                log::info!("deleted workspace {}", name);
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(BackendError::WorkspaceNotFound(name.to_string())),
            _ => Err(wrap(status_error(BACKEND, response).await, "delete workspace")),
        }
    }

    async fn get_lock_info(&self) -> BackendResult<LockInfo> {
        let state = self.state.read().await;
        Err(BackendError::LockNotFound(format!(
            "locks on workspace {} are managed by the service",
            state.workspace
        )))
    }

    async fn validate(&self) -> BackendResult<()> {
        let url = self.url(&["organizations", self.organization.as_str()])?;
        let response = self.send(Method::GET, url, |r| r).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(BackendError::configuration(format!(
                    "organization {} not found on {}",
                    self.organization, self.hostname
                )));
            }
            StatusCode::UNAUTHORIZED => {
                return Err(BackendError::configuration(format!(
                    "token rejected by {}",
                    self.hostname
                )));
            }
            _ => return Err(status_error(BACKEND, response).await),
        }

        let state = self.state.read().await;
        let id = self.workspace_id(&state.workspace).await?;
        log::debug!("validated workspace {} ({})", state.workspace, id);
        Ok(())
    }

    async fn metadata(&self) -> BackendMetadata {
        let state = self.state.read().await;
        BackendMetadata {
            backend_type: BACKEND.to_string(),
            supports_locking: true,
            supports_versions: true,
            supports_workspaces: true,
            configuration: BTreeMap::from([
                ("hostname".to_string(), self.hostname.clone()),
                ("organization".to_string(), self.organization.clone()),
                ("workspace".to_string(), state.workspace.clone()),
            ]),
            workspace: state.workspace.clone(),
            state_key: state.workspace.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_workspace(server: &MockServer, name: &str, id: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/api/v2/organizations/acme/workspaces/{}", name)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"id": id, "type": "workspaces", "attributes": {"name": name}}
            })))
            .mount(server)
            .await;
    }

    fn config(server: &MockServer) -> BackendConfig {
        BackendConfig::new("remote")
            .with_attribute("organization", "acme")
            .with_attribute("workspace", "app")
            .with_attribute("token", "secret-token")
            .with_attribute("address", server.uri())
            .with_attribute("skip_validation", true)
    }

    async fn backend(server: &MockServer) -> RemoteBackend {
        mock_workspace(server, "app", "ws-app").await;
        RemoteBackend::from_config(&config(server)).await.unwrap()
    }

    #[tokio::test]
    async fn test_requires_token() {
        let config = BackendConfig::new("remote")
            .with_attribute("organization", "acme")
            .with_attribute("workspace", "app");
        assert!(matches!(
            RemoteBackend::from_config(&config).await,
            Err(BackendError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/organizations/acme"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let config = config(&server).with_attribute("skip_validation", false);
        assert!(matches!(
            RemoteBackend::from_config(&config).await,
            Err(BackendError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_pull_without_state_version_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/workspaces/ws-app/current-state-version"))
            .and(header("authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let state = backend(&server).await.pull().await.unwrap();
        assert_eq!(state.version, 4);
        assert_eq!(state.serial, 0);
    }

    #[tokio::test]
    async fn test_pull_downloads_current_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/workspaces/ws-app/current-state-version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"id": "sv-1", "type": "state-versions", "attributes": {"serial": 3}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/state-versions/sv-1/download"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "version": 4,
                "terraform_version": "1.7.5",
                "serial": 3,
                "lineage": "L9",
                "resources": [],
                "outputs": {}
            })))
            .mount(&server)
            .await;

        let state = backend(&server).await.pull().await.unwrap();
        assert_eq!(state.serial, 3);
        assert_eq!(state.lineage, "L9");
    }

    #[tokio::test]
    async fn test_push_creates_version_then_uploads() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/state-versions"))
            .and(body_partial_json(serde_json::json!({
                "data": {
                    "type": "state-versions",
                    "attributes": {"serial": 4, "lineage": "L1"},
                    "relationships": {"workspace": {"data": {"id": "ws-app"}}}
                }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "data": {"id": "sv-4", "type": "state-versions", "attributes": {}}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/v2/state-versions/sv-4/upload"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut state = StateData::with_lineage("L1");
        state.serial = 4;
        backend(&server).await.push(&state).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let create = requests
            .iter()
            .find(|r| r.method.as_str() == "POST")
            .unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&create.body).unwrap();
        let attributes = payload["data"]["attributes"].as_object().unwrap();
        let mut keys: Vec<&str> = attributes.keys().map(String::as_str).collect();
        keys.sort();
        assert_eq!(keys, vec!["lineage", "serial"]);
    }

    #[tokio::test]
    async fn test_locks_are_synthetic() {
        let server = MockServer::start().await;
        let backend = backend(&server).await;
        let id = backend.lock(&LockInfo::new("apply")).await.unwrap();
        assert!(id.starts_with("tc-lock-"));
        backend.unlock("anything").await.unwrap();
        assert!(matches!(
            backend.get_lock_info().await,
            Err(BackendError::LockNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_versions_from_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/workspaces/ws-app/state-versions"))
            .and(query_param("page[number]", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"id": "sv-2", "type": "state-versions", "attributes": {
                        "serial": 2, "created-at": "2024-05-02T10:00:00Z", "size": 900
                    }},
                    {"id": "sv-1", "type": "state-versions", "attributes": {
                        "serial": 1, "created-at": "2024-05-01T10:00:00Z", "size": 800
                    }}
                ],
                "meta": {"pagination": {"current-page": 1, "next-page": null}}
            })))
            .mount(&server)
            .await;

        let versions = backend(&server).await.get_versions().await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version_id, "sv-2");
        assert!(versions[0].is_latest);
        assert_eq!(versions[1].serial, 1);
        assert_eq!(versions[1].size, 800);
    }

    #[tokio::test]
    async fn test_workspace_rules() {
        let server = MockServer::start().await;
        mock_workspace(&server, "staging", "ws-staging").await;
        Mock::given(method("GET"))
            .and(path("/api/v2/organizations/acme/workspaces/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v2/workspaces/ws-staging"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        let backend = backend(&server).await;

        assert!(matches!(
            backend.create_workspace("default").await,
            Err(BackendError::DefaultWorkspace(_))
        ));
        assert!(matches!(
            backend.delete_workspace("app").await,
            Err(BackendError::CurrentWorkspace(_))
        ));
        assert!(matches!(
            backend.select_workspace("missing").await,
            Err(BackendError::WorkspaceNotFound(_))
        ));
        assert_eq!(backend.metadata().await.workspace, "app");

        backend.select_workspace("staging").await.unwrap();
        // Still refused once another workspace is selected
        assert!(matches!(
            backend.delete_workspace("app").await,
            Err(BackendError::CurrentWorkspace(_))
        ));
        backend.select_workspace("app").await.unwrap();
        backend.delete_workspace("staging").await.unwrap();
    }
}
