//! Local file backend for state storage
//!
//! The default workspace lives at `<path>/terraform.tfstate`, any other at
//! `<path>/workspaces/<name>/terraform.tfstate`. A sibling `.lock` file holding
//! the serialized [`LockInfo`] is the lock; each push first copies the current
//! file into `.terraform/backups/` next to it.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::sync::RwLock;

use crate::backend::{
    BackendError, BackendMetadata, BackendResult, DEFAULT_WORKSPACE, StateBackend,
    check_create_workspace, check_delete_workspace, check_select_workspace,
};
use crate::config::{BackendConfig, LockConfig};
use crate::lock::{LockInfo, acquire_with_timeout};
use crate::state::{StateData, StateVersion, check_successor, normalize_versions};

const STATE_FILE: &str = "terraform.tfstate";
const WORKSPACES_DIR: &str = "workspaces";
const BACKUP_TIMESTAMP: &str = "%Y%m%d%H%M%S%9f";

struct LocalState {
    workspace: String,
}

/// Local file backend for development and simple use cases
pub struct LocalBackend {
    base_path: PathBuf,
    lock_config: LockConfig,
    state: RwLock<LocalState>,
}

impl LocalBackend {
    /// Create a LocalBackend rooted at `base_path` in the default workspace
    pub fn with_path(base_path: impl Into<PathBuf>) -> BackendResult<Self> {
        let base_path: PathBuf = base_path.into();
        let config = BackendConfig::new("local")
            .with_attribute("path", base_path.to_string_lossy().into_owned());
        Self::from_config(&config)
    }

    /// Create a LocalBackend from configuration (`path`, default `.`)
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        check_select_workspace(config.workspace())?;
        let base_path = PathBuf::from(config.get_string("path").unwrap_or("."));
        std::fs::create_dir_all(&base_path)
            .map_err(|e| BackendError::Io(format!("Failed to create base directory: {}", e)))?;

        Ok(Self {
            base_path,
            lock_config: config.lock.clone(),
            state: RwLock::new(LocalState {
                workspace: config.workspace().to_string(),
            }),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn workspace_dir(&self, workspace: &str) -> PathBuf {
        if workspace == DEFAULT_WORKSPACE {
            self.base_path.clone()
        } else {
            self.base_path.join(WORKSPACES_DIR).join(workspace)
        }
    }

    fn state_path(&self, workspace: &str) -> PathBuf {
        self.workspace_dir(workspace).join(STATE_FILE)
    }

    fn backup_dir(&self, workspace: &str) -> PathBuf {
        self.workspace_dir(workspace).join(".terraform").join("backups")
    }

    fn workspace_exists(&self, workspace: &str) -> bool {
        workspace == DEFAULT_WORKSPACE || self.workspace_dir(workspace).is_dir()
    }

    /// Remove the lock file after checking it belongs to `lock_id`
    ///
    /// Unlike `unlock`, a missing lock file is an error.
    pub async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        let state = self.state.write().await;
        let lock_path = lock_path(&self.state_path(&state.workspace));

        let Some(existing) = read_lock_file(&lock_path)? else {
            return Err(BackendError::LockNotFound(lock_id.to_string()));
        };
        if existing.id != lock_id {
            return Err(BackendError::LockMismatch {
                expected: existing.id,
                actual: lock_id.to_string(),
            });
        }

        remove_lock_file(&lock_path)?;
        log::warn!("force-unlocked {} (lock {})", lock_path.display(), lock_id);
        Ok(())
    }

    async fn try_lock(&self, info: &LockInfo) -> BackendResult<String> {
        let state = self.state.write().await;
        let state_path = self.state_path(&state.workspace);
        let lock_path = lock_path(&state_path);

        let id = info.id_or_generate();
        let mut lock = info.with_id(&id);
        if lock.path.is_empty() {
            lock.path = state_path.to_string_lossy().into_owned();
        }
        let content = serde_json::to_string_pretty(&lock)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize lock: {}", e)))?;

        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BackendError::Io(format!("Failed to create state directory: {}", e)))?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(mut file) => {
                file.write_all(content.as_bytes())
                    .and_then(|_| file.sync_all())
                    .map_err(|e| BackendError::Io(format!("Failed to write lock file: {}", e)))?;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(match read_lock_file(&lock_path) {
                    Ok(Some(existing)) => BackendError::locked(&existing),
                    _ => BackendError::Locked {
                        lock_id: String::new(),
                        who: "unknown".to_string(),
                        operation: String::new(),
                        created: String::new(),
                    },
                });
            }
            Err(e) => return Err(BackendError::Io(format!("Failed to create lock file: {}", e))),
        }

        log::info!("acquired lock {} on {}", id, state_path.display());
        Ok(id)
    }

    fn read_version(&self, path: &Path) -> BackendResult<Option<StateData>> {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackendError::Io(format!("Failed to read state file: {}", e))),
        };
        if content.is_empty() {
            return Ok(None);
        }
        StateData::from_bytes(content, modified_time(path)).map(Some)
    }

    /// Copy the live state into the backup directory, if there is one
    fn backup(&self, workspace: &str) -> BackendResult<Option<PathBuf>> {
        let state_path = self.state_path(workspace);
        if !state_path.exists() {
            return Ok(None);
        }

        let backup_dir = self.backup_dir(workspace);
        std::fs::create_dir_all(&backup_dir)
            .map_err(|e| BackendError::Io(format!("Failed to create backup directory: {}", e)))?;

        let timestamp = Utc::now().format(BACKUP_TIMESTAMP);
        let backup_path = backup_dir.join(format!("{}.{}", STATE_FILE, timestamp));
        std::fs::copy(&state_path, &backup_path)
            .map_err(|e| BackendError::Io(format!("Failed to create backup: {}", e)))?;

        log::debug!("backed up {} to {}", state_path.display(), backup_path.display());
        Ok(Some(backup_path))
    }

    fn write_state_file(&self, workspace: &str, body: &[u8]) -> BackendResult<()> {
        let state_path = self.state_path(workspace);
        if let Some(parent) = state_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BackendError::Io(format!("Failed to create state directory: {}", e)))?;
        }

        let temp_path = state_path.with_extension("tfstate.tmp");
        std::fs::write(&temp_path, body)
            .map_err(|e| BackendError::Io(format!("Failed to write state file: {}", e)))?;
        std::fs::rename(&temp_path, &state_path)
            .map_err(|e| BackendError::Io(format!("Failed to replace state file: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl StateBackend for LocalBackend {
    async fn pull(&self) -> BackendResult<StateData> {
        let state = self.state.read().await;
        Ok(self
            .read_version(&self.state_path(&state.workspace))?
            .unwrap_or_else(StateData::empty))
    }

    async fn push(&self, data: &StateData) -> BackendResult<()> {
        let state = self.state.write().await;
        let body = data.encode()?;

        let current = match self.read_version(&self.state_path(&state.workspace)) {
            Ok(current) => current,
            Err(BackendError::InvalidState(e)) => {
                log::warn!("replacing unreadable local state: {}", e);
                None
            }
            Err(e) => return Err(e),
        };
        if !check_successor(current.as_ref(), data, &body)? {
            return Ok(());
        }

        self.backup(&state.workspace)?;
        self.write_state_file(&state.workspace, &body)
    }

    async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        acquire_with_timeout(&self.lock_config, || self.try_lock(info)).await
    }

    async fn unlock(&self, lock_id: &str) -> BackendResult<()> {
        let state = self.state.write().await;
        let lock_path = lock_path(&self.state_path(&state.workspace));

        match read_lock_file(&lock_path)? {
            None => {}
            Some(existing) if existing.id != lock_id => {
                return Err(BackendError::LockMismatch {
                    expected: existing.id,
                    actual: lock_id.to_string(),
                });
            }
            Some(_) => {
                remove_lock_file(&lock_path)?;
                log::info!("released lock {} on {}", lock_id, lock_path.display());
            }
        }
        Ok(())
    }

    async fn get_versions(&self) -> BackendResult<Vec<StateVersion>> {
        let state = self.state.read().await;
        let mut versions = Vec::new();

        if let Some(current) = self.read_version(&self.state_path(&state.workspace))? {
            versions.push(StateVersion {
                id: "current".to_string(),
                version_id: "current".to_string(),
                serial: current.serial,
                created: current.last_modified,
                size: current.size,
                checksum: current.checksum.clone(),
                is_latest: true,
                description: Some("live state".to_string()),
            });
        }

        let entries = match std::fs::read_dir(self.backup_dir(&state.workspace)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(BackendError::Io(format!("Failed to read backups: {}", e))),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(timestamp) = name.strip_prefix(&format!("{}.", STATE_FILE)) else {
                continue;
            };
            let path = entry.path();
            let Ok(Some(backup)) = self.read_version(&path) else {
                log::debug!("skipping unreadable backup {}", path.display());
                continue;
            };

            let created = NaiveDateTime::parse_from_str(timestamp, BACKUP_TIMESTAMP)
                .map(|t| t.and_utc())
                .unwrap_or(backup.last_modified);
            versions.push(StateVersion {
                id: name.clone(),
                version_id: name,
                serial: backup.serial,
                created,
                size: backup.size,
                checksum: backup.checksum,
                is_latest: false,
                description: None,
            });
        }

        Ok(normalize_versions(versions))
    }

    async fn get_version(&self, version_id: &str) -> BackendResult<StateData> {
        if version_id.is_empty() || version_id == "current" {
            return self.pull().await;
        }
        if version_id.contains('/') || version_id.contains('\\') || version_id.starts_with('.') {
            return Err(BackendError::VersionNotFound(version_id.to_string()));
        }

        let state = self.state.read().await;
        self.read_version(&self.backup_dir(&state.workspace).join(version_id))?
            .ok_or_else(|| BackendError::VersionNotFound(version_id.to_string()))
    }

    async fn list_workspaces(&self) -> BackendResult<Vec<String>> {
        let _state = self.state.read().await;
        let mut names = vec![DEFAULT_WORKSPACE.to_string()];

        let dir = self.base_path.join(WORKSPACES_DIR);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(BackendError::Io(format!("Failed to list workspaces: {}", e))),
        };

        let mut found: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name != DEFAULT_WORKSPACE)
            .collect();
        found.sort();
        names.extend(found);
        Ok(names)
    }

    async fn select_workspace(&self, name: &str) -> BackendResult<()> {
        check_select_workspace(name)?;
        let mut state = self.state.write().await;
        if !self.workspace_exists(name) {
            return Err(BackendError::WorkspaceNotFound(name.to_string()));
        }
        state.workspace = name.to_string();
        Ok(())
    }

    async fn create_workspace(&self, name: &str) -> BackendResult<()> {
        check_create_workspace(name)?;
        let _state = self.state.write().await;
        if self.workspace_exists(name) {
            return Err(BackendError::WorkspaceExists(name.to_string()));
        }

        std::fs::create_dir_all(self.workspace_dir(name))
            .map_err(|e| BackendError::Io(format!("Failed to create workspace directory: {}", e)))?;
        self.write_state_file(name, &StateData::empty().encode()?)?;
        log::info!("created workspace {}", name);
        Ok(())
    }

    async fn delete_workspace(&self, name: &str) -> BackendResult<()> {
        let state = self.state.write().await;
        check_delete_workspace(name, &state.workspace)?;
        if !self.workspace_exists(name) {
            return Err(BackendError::WorkspaceNotFound(name.to_string()));
        }
        if let Some(holder) = read_lock_file(&lock_path(&self.state_path(name)))? {
            return Err(BackendError::locked(&holder));
        }

        std::fs::remove_dir_all(self.workspace_dir(name))
            .map_err(|e| BackendError::Io(format!("Failed to delete workspace {}: {}", name, e)))?;
        log::info!("deleted workspace {}", name);
        Ok(())
    }

    async fn get_lock_info(&self) -> BackendResult<LockInfo> {
        let state = self.state.read().await;
        let lock_path = lock_path(&self.state_path(&state.workspace));
        read_lock_file(&lock_path)?
            .ok_or_else(|| BackendError::LockNotFound(lock_path.display().to_string()))
    }

    async fn validate(&self) -> BackendResult<()> {
        if !self.base_path.is_dir() {
            return Err(BackendError::configuration(format!(
                "cannot access base path {}",
                self.base_path.display()
            )));
        }

        let check = self.base_path.join(".tfstate-backend-write-check");
        std::fs::write(&check, b"ok").map_err(|e| {
            BackendError::configuration(format!(
                "cannot write to base path {}: {}",
                self.base_path.display(),
                e
            ))
        })?;
        if let Err(e) = std::fs::remove_file(&check) {
            log::debug!("failed to remove {}: {}", check.display(), e);
        }
        Ok(())
    }

    async fn metadata(&self) -> BackendMetadata {
        let state = self.state.read().await;
        BackendMetadata {
            backend_type: "local".to_string(),
            supports_locking: true,
            supports_versions: true,
            supports_workspaces: true,
            configuration: BTreeMap::from([(
                "path".to_string(),
                self.base_path.display().to_string(),
            )]),
            workspace: state.workspace.clone(),
            state_key: self.state_path(&state.workspace).display().to_string(),
        }
    }
}

fn lock_path(state_path: &Path) -> PathBuf {
    let mut path = state_path.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

fn read_lock_file(path: &Path) -> BackendResult<Option<LockInfo>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BackendError::Io(format!("Failed to read lock file: {}", e))),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| BackendError::InvalidState(format!("Failed to parse lock file: {}", e)))
}

fn remove_lock_file(path: &Path) -> BackendResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackendError::Io(format!("Failed to remove lock file: {}", e))),
    }
}

fn modified_time(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}
