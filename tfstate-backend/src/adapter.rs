//! Flat-key access to a workspace-aware backend
//!
//! Callers that address state by a single key (`env/production`,
//! `workspaces/staging`, `terraform.tfstate`) go through [`StateAdapter`],
//! which maps each key to a workspace and then to the backend operations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::backend::{BackendError, BackendResult, DEFAULT_WORKSPACE, StateBackend};
use crate::backends::create_backend;
use crate::config::BackendConfig;
use crate::lock::LockInfo;
use crate::state::StateData;

/// Path segments that introduce a workspace name
const WORKSPACE_MARKERS: &[&str] = &["env", "workspaces"];

/// Workspace addressed by a flat key
///
/// `env/<name>` and `workspaces/<name>` anywhere in the key select `<name>`;
/// any other key is the workspace name itself; an empty key is `default`.
/// `.` and `..` never count as a name, so such keys fail workspace validation.
pub fn workspace_from_key(key: &str) -> String {
    let key = key.trim_matches('/');
    let segments: Vec<&str> = key.split('/').collect();

    let named = segments
        .windows(2)
        .find(|pair| {
            WORKSPACE_MARKERS.contains(&pair[0]) && !matches!(pair[1], "" | "." | "..")
        })
        .map(|pair| pair[1]);

    match named {
        Some(name) => name.to_string(),
        None if key.is_empty() => DEFAULT_WORKSPACE.to_string(),
        None => key.to_string(),
    }
}

/// A history entry as seen through the adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVersionInfo {
    pub key: String,
    pub workspace: String,
    pub version_id: String,
    pub serial: u64,
    pub created: DateTime<Utc>,
    pub size: u64,
    pub is_latest: bool,
}

/// Key-addressed facade over a [`StateBackend`]
pub struct StateAdapter {
    backend: Box<dyn StateBackend>,
    /// Serializes select-then-operate sequences
    op_lock: Mutex<()>,
    /// Lock ids handed out by `lock`, by workspace
    locks: parking_lot::Mutex<HashMap<String, String>>,
}

impl StateAdapter {
    pub fn new(backend: Box<dyn StateBackend>) -> Self {
        Self {
            backend,
            op_lock: Mutex::new(()),
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Build the backend named by `config` and wrap it
    ///
    /// Backend types without an implementation come back as
    /// [`BackendError::Unsupported`]; a known type with bad attributes keeps
    /// its own error.
    pub async fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        match create_backend(config).await {
            Ok(backend) => Ok(Self::new(backend)),
            Err(BackendError::Unsupported {
                backend_type,
                reason,
            }) => Err(BackendError::unsupported_backend(
                backend_type,
                format!("unsupported backend type ({})", reason),
            )),
            Err(e) => Err(e),
        }
    }

    pub fn backend(&self) -> &dyn StateBackend {
        self.backend.as_ref()
    }

    /// Select the key's workspace; `None` when it does not exist
    async fn select(&self, key: &str) -> BackendResult<Option<String>> {
        let workspace = workspace_from_key(key);
        match self.backend.select_workspace(&workspace).await {
            Ok(()) => Ok(Some(workspace)),
            Err(BackendError::WorkspaceNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// State bytes stored under `key`; an empty state when nothing is there
    pub async fn get(&self, key: &str) -> BackendResult<Vec<u8>> {
        let _op = self.op_lock.lock().await;
        match self.select(key).await? {
            Some(_) => self.backend.pull().await?.encode(),
            None => StateData::empty().encode(),
        }
    }

    /// Store raw state bytes under `key`, creating its workspace if needed
    pub async fn put(&self, key: &str, data: &[u8]) -> BackendResult<()> {
        let state = StateData::from_bytes(data.to_vec(), Utc::now()).map_err(|e| match e {
            BackendError::InvalidState(msg) => {
                BackendError::InvalidState(format!("failed to parse state: {}", msg))
            }
            other => other,
        })?;

        let _op = self.op_lock.lock().await;
        if self.select(key).await?.is_none() {
            let workspace = workspace_from_key(key);
            self.backend.create_workspace(&workspace).await?;
            self.backend.select_workspace(&workspace).await?;
        }
        self.backend.push(&state).await
    }

    /// Remove the workspace behind `key`
    pub async fn delete(&self, key: &str) -> BackendResult<()> {
        let _op = self.op_lock.lock().await;
        let workspace = workspace_from_key(key);

        // The selected workspace can't be deleted, so step off it first
        if self.backend.metadata().await.workspace == workspace && workspace != DEFAULT_WORKSPACE {
            self.backend.select_workspace(DEFAULT_WORKSPACE).await?;
        }
        self.backend.delete_workspace(&workspace).await
    }

    /// Workspace names starting with `prefix` (all of them for an empty prefix)
    pub async fn list(&self, prefix: &str) -> BackendResult<Vec<String>> {
        let _op = self.op_lock.lock().await;
        Ok(self
            .backend
            .list_workspaces()
            .await?
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    pub async fn lock(&self, key: &str) -> BackendResult<String> {
        let _op = self.op_lock.lock().await;
        let workspace = self
            .select(key)
            .await?
            .ok_or_else(|| BackendError::WorkspaceNotFound(workspace_from_key(key)))?;

        let id = self
            .backend
            .lock(&LockInfo::new("adapter").with_path(key))
            .await?;
        self.locks.lock().insert(workspace, id.clone());
        Ok(id)
    }

    /// Release the lock taken through `lock`; a key never locked is a no-op
    pub async fn unlock(&self, key: &str) -> BackendResult<()> {
        let _op = self.op_lock.lock().await;
        let workspace = workspace_from_key(key);
        let Some(id) = self.locks.lock().get(&workspace).cloned() else {
            return Ok(());
        };

        self.backend.select_workspace(&workspace).await?;
        self.backend.unlock(&id).await?;
        self.locks.lock().remove(&workspace);
        Ok(())
    }

    pub async fn list_states(&self) -> BackendResult<Vec<String>> {
        let _op = self.op_lock.lock().await;
        self.backend.list_workspaces().await
    }

    /// History of the state under `key`, newest first
    pub async fn list_state_versions(&self, key: &str) -> BackendResult<Vec<StateVersionInfo>> {
        let _op = self.op_lock.lock().await;
        let Some(workspace) = self.select(key).await? else {
            return Ok(Vec::new());
        };

        Ok(self
            .backend
            .get_versions()
            .await?
            .into_iter()
            .map(|v| StateVersionInfo {
                key: key.to_string(),
                workspace: workspace.clone(),
                version_id: v.version_id,
                serial: v.serial,
                created: v.created,
                size: v.size,
                is_latest: v.is_latest,
            })
            .collect())
    }

    /// State bytes of the `index`-th history entry (0 is the newest)
    pub async fn get_state_version(&self, key: &str, index: usize) -> BackendResult<Vec<u8>> {
        let _op = self.op_lock.lock().await;
        let not_found = || BackendError::VersionNotFound(format!("{}@{}", key, index));
        if self.select(key).await?.is_none() {
            return Err(not_found());
        }

        let versions = self.backend.get_versions().await?;
        let version = versions.get(index).ok_or_else(not_found)?;
        self.backend.get_version(&version.version_id).await?.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryObjectStore, ObjectStorageBackend};

    fn adapter() -> StateAdapter {
        StateAdapter::new(Box::new(ObjectStorageBackend::new(
            MemoryObjectStore::new(),
            "terraform.tfstate",
            &BackendConfig::new("memory"),
        )))
    }

    fn state_json(serial: u64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "version": 4,
            "terraform_version": "1.5.0",
            "serial": serial,
            "lineage": "test-lineage",
            "resources": [],
            "outputs": {}
        }))
        .unwrap()
    }

    #[test]
    fn test_workspace_from_key() {
        assert_eq!(workspace_from_key("terraform.tfstate"), "terraform.tfstate");
        assert_eq!(workspace_from_key("env/production"), "production");
        assert_eq!(workspace_from_key("workspaces/staging"), "staging");
        assert_eq!(workspace_from_key("project/env/development"), "development");
        assert_eq!(workspace_from_key(""), "default");
        assert_eq!(workspace_from_key("/"), "default");
        assert_eq!(workspace_from_key("env/.."), "env/..");
        assert_eq!(workspace_from_key("workspaces/./x"), "workspaces/./x");
    }

    #[tokio::test]
    async fn test_dot_segments_never_reach_the_backend() {
        let adapter = adapter();
        adapter.put("env/production", &state_json(1)).await.unwrap();

        for key in ["env/..", "workspaces/.", ".."] {
            assert!(adapter.delete(key).await.is_err(), "{}", key);
            assert!(adapter.get(key).await.is_err(), "{}", key);
        }
        assert_eq!(
            adapter.list_states().await.unwrap(),
            vec!["default", "production"]
        );
    }

    #[tokio::test]
    async fn test_get_missing_key_is_empty_state() {
        let adapter = adapter();
        let data = adapter.get("env/nowhere").await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["serial"], 0);
        assert_eq!(value["version"], 4);
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let adapter = adapter();
        adapter.put("env/production", &state_json(1)).await.unwrap();

        let data = adapter.get("env/production").await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["serial"], 1);
        assert_eq!(value["lineage"], "test-lineage");
        assert_eq!(value["terraform_version"], "1.5.0");

        assert_eq!(
            adapter.list_states().await.unwrap(),
            vec!["default", "production"]
        );
        assert_eq!(adapter.list("prod").await.unwrap(), vec!["production"]);
    }

    #[tokio::test]
    async fn test_put_rejects_invalid_json() {
        let err = adapter().put("x", b"{not json").await.unwrap_err();
        assert!(err.to_string().contains("failed to parse state"));
    }

    #[tokio::test]
    async fn test_delete_selected_workspace() {
        let adapter = adapter();
        adapter.put("test.tfstate", &state_json(1)).await.unwrap();
        adapter.delete("test.tfstate").await.unwrap();

        let data = adapter.get("test.tfstate").await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["serial"], 0);
        assert!(matches!(
            adapter.delete("").await,
            Err(BackendError::DefaultWorkspace(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_unlock_by_key() {
        let adapter = adapter();
        let id = adapter.lock("terraform").await.err();
        assert!(matches!(id, Some(BackendError::WorkspaceNotFound(_))));

        adapter.lock("").await.unwrap();
        assert!(matches!(
            adapter.lock("").await,
            Err(BackendError::Locked { .. })
        ));
        adapter.unlock("").await.unwrap();
        adapter.unlock("").await.unwrap();
        adapter.lock("").await.unwrap();
    }

    #[tokio::test]
    async fn test_state_versions_by_index() {
        let adapter = adapter();
        adapter.put("", &state_json(1)).await.unwrap();
        adapter.put("", &state_json(2)).await.unwrap();

        let versions = adapter.list_state_versions("").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[0].is_latest);
        assert_eq!(versions[0].workspace, "default");

        let newest: serde_json::Value =
            serde_json::from_slice(&adapter.get_state_version("", 0).await.unwrap()).unwrap();
        assert_eq!(newest["serial"], 2);
        let oldest: serde_json::Value =
            serde_json::from_slice(&adapter.get_state_version("", 1).await.unwrap()).unwrap();
        assert_eq!(oldest["serial"], 1);
        assert!(matches!(
            adapter.get_state_version("", 5).await,
            Err(BackendError::VersionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config_error_categories() {
        match StateAdapter::from_config(&BackendConfig::new("consul")).await {
            Err(BackendError::Unsupported { backend_type, .. }) => {
                assert_eq!(backend_type, "consul")
            }
            _ => panic!("expected Unsupported"),
        }
        assert!(matches!(
            StateAdapter::from_config(&BackendConfig::new("azurerm")).await,
            Err(BackendError::Configuration(_))
        ));
    }
}
