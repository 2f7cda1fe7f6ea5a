//! Object-storage backend family
//!
//! [`ObjectStorageBackend`] implements the backend contract once on top of
//! the primitive operations of an [`ObjectStore`]. Substrates differ only in
//! how they lock:
//!
//! - [`LockStrategy::ConditionalCreate`]: a `<key>.tflock` marker holding the
//!   serialized [`LockInfo`] is created only if absent (S3, GCS)
//! - [`LockStrategy::Lease`]: a time-bounded lease on the state object itself,
//!   renewed in the background while held (Azure blob storage)
//!
//! Object layout: the default workspace lives at `<dir>/<base>`, any other at
//! `<dir>/env:/<workspace>/<base>`, so listing `<dir>/env:/` enumerates
//! workspaces.

mod azure;
mod gcs;
mod memory;
mod s3;

pub use azure::AzureBlobStore;
pub use gcs::GcsStore;
pub use memory::MemoryObjectStore;
pub use s3::S3Store;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    BackendError, BackendMetadata, BackendResult, DEFAULT_WORKSPACE, StateBackend,
    check_create_workspace, check_delete_workspace, check_select_workspace, format_time,
};
use crate::config::{BackendConfig, LockConfig};
use crate::lock::{LockInfo, acquire_with_timeout};
use crate::state::{StateData, StateVersion, check_successor, normalize_versions};

/// S3 state backend
pub type S3Backend = ObjectStorageBackend<S3Store>;
/// Azure blob storage state backend
pub type AzureBackend = ObjectStorageBackend<AzureBlobStore>;
/// Google Cloud Storage state backend
pub type GcsBackend = ObjectStorageBackend<GcsStore>;

pub(crate) const META_SERIAL: &str = "serial";
pub(crate) const META_LINEAGE: &str = "lineage";
pub(crate) const META_TERRAFORM_VERSION: &str = "terraform_version";
const META_LOCK_ID: &str = "lock_id";
const META_LOCK_OPERATION: &str = "lock_operation";
const META_LOCK_WHO: &str = "lock_who";
const META_LOCK_CREATED: &str = "lock_created";

const LOCK_SUFFIX: &str = ".tflock";

/// How a substrate provides mutual exclusion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    Lease,
    ConditionalCreate,
}

/// Properties of a stored object
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub meta: ObjectMeta,
}

/// An entry of an object's native history (version, snapshot or generation)
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectVersion {
    pub version_id: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub is_latest: bool,
    /// State serial when the substrate reported it without a download
    pub serial: Option<u64>,
    pub checksum: String,
}

/// Primitive operations of an object-storage substrate
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Backend type name reported in metadata
    fn kind(&self) -> &'static str;

    fn lock_strategy(&self) -> LockStrategy;

    /// Non-secret configuration for display
    fn describe(&self) -> BTreeMap<String, String>;

    async fn get(&self, key: &str) -> BackendResult<Option<StoredObject>>;

    async fn get_version(&self, key: &str, version_id: &str)
    -> BackendResult<Option<StoredObject>>;

    async fn head(&self, key: &str) -> BackendResult<Option<ObjectMeta>>;

    /// Replace the object in a single upload
    ///
    /// `lease_id` is passed when the caller holds a lease on the object.
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: &BTreeMap<String, String>,
        lease_id: Option<&str>,
    ) -> BackendResult<()>;

    /// Create the object only if absent; `false` when it already exists
    async fn put_if_absent(&self, key: &str, body: Bytes) -> BackendResult<bool>;

    /// Remove the object; removing a missing object succeeds
    async fn delete(&self, key: &str) -> BackendResult<()>;

    /// Keys of live objects starting with `prefix`
    async fn list(&self, prefix: &str) -> BackendResult<Vec<String>>;

    async fn list_versions(&self, key: &str) -> BackendResult<Vec<ObjectVersion>>;

    async fn check_access(&self) -> BackendResult<()>;

    /// Lease length the substrate actually grants when asked for `requested`
    fn lease_duration(&self, requested: Duration) -> Duration {
        requested
    }

    /// Take a lease, proposing `lease_id`; `None` when another lease is active
    async fn acquire_lease(
        &self,
        _key: &str,
        _duration: Duration,
        _lease_id: &str,
    ) -> BackendResult<Option<String>> {
        Err(BackendError::unsupported_backend(
            self.kind(),
            "leases are not supported",
        ))
    }

    async fn renew_lease(&self, _key: &str, _lease_id: &str) -> BackendResult<()> {
        Err(BackendError::unsupported_backend(
            self.kind(),
            "leases are not supported",
        ))
    }

    async fn release_lease(&self, _key: &str, _lease_id: &str) -> BackendResult<()> {
        Err(BackendError::unsupported_backend(
            self.kind(),
            "leases are not supported",
        ))
    }

    /// Replace the object's metadata without changing its body
    async fn set_metadata(
        &self,
        _key: &str,
        _metadata: &BTreeMap<String, String>,
        _lease_id: Option<&str>,
    ) -> BackendResult<()> {
        Err(BackendError::unsupported_backend(
            self.kind(),
            "metadata updates are not supported",
        ))
    }
}

/// Maps workspaces to object keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyLayout {
    dir: String,
    base: String,
    workspace_prefix: String,
}

impl KeyLayout {
    pub(crate) fn new(key: &str, workspace_prefix: &str) -> Self {
        let key = key.trim_matches('/');
        let (dir, base) = match key.rsplit_once('/') {
            Some((dir, base)) => (dir.to_string(), base.to_string()),
            None => (String::new(), key.to_string()),
        };
        Self {
            dir,
            base,
            workspace_prefix: workspace_prefix.trim_matches('/').to_string(),
        }
    }

    pub(crate) fn state_key(&self, workspace: &str) -> String {
        if workspace == DEFAULT_WORKSPACE {
            self.join(&self.base)
        } else {
            self.join(&format!("{}/{}/{}", self.workspace_prefix, workspace, self.base))
        }
    }

    pub(crate) fn workspaces_prefix(&self) -> String {
        self.join(&format!("{}/", self.workspace_prefix))
    }

    /// Workspace whose state lives at `key`, if `key` is a workspace state object
    pub(crate) fn workspace_of(&self, key: &str) -> Option<String> {
        let rest = key.strip_prefix(&self.workspaces_prefix())?;
        let (workspace, base) = rest.split_once('/')?;
        (base == self.base && !workspace.is_empty()).then(|| workspace.to_string())
    }

    fn join(&self, tail: &str) -> String {
        if self.dir.is_empty() {
            tail.to_string()
        } else {
            format!("{}/{}", self.dir, tail)
        }
    }
}

/// Background renewal of a held lease, cancelled on unlock or drop
pub(crate) struct LeaseRenewal {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl LeaseRenewal {
    pub(crate) fn spawn<S: ObjectStore>(
        store: Arc<S>,
        key: String,
        lease_id: String,
        every: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let every = every.max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.renew_lease(&key, &lease_id).await {
                            log::warn!("failed to renew lease on {}, lock will expire: {}", key, e);
                            break;
                        }
                        log::debug!("renewed lease on {}", key);
                    }
                }
            }
        });

        Self { token, handle }
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for LeaseRenewal {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct HeldLock {
    id: String,
    info: LockInfo,
    renewal: Option<LeaseRenewal>,
}

struct BackendState {
    workspace: String,
    /// Locks held by this instance, keyed by state object key
    locks: HashMap<String, HeldLock>,
}

/// A state backend on top of any [`ObjectStore`]
pub struct ObjectStorageBackend<S: ObjectStore> {
    store: Arc<S>,
    layout: KeyLayout,
    lock_config: LockConfig,
    state: RwLock<BackendState>,
}

impl<S: ObjectStore> ObjectStorageBackend<S> {
    pub fn new(store: S, key: &str, config: &BackendConfig) -> Self {
        Self::with_layout(store, KeyLayout::new(key, "env:"), config)
    }

    pub(crate) fn with_layout(store: S, layout: KeyLayout, config: &BackendConfig) -> Self {
        Self {
            store: Arc::new(store),
            layout,
            lock_config: config.lock.clone(),
            state: RwLock::new(BackendState {
                workspace: config.workspace().to_string(),
                locks: HashMap::new(),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Whether the lease renewal task for the current workspace's lock is running
    pub async fn lease_renewal_active(&self) -> bool {
        let state = self.state.read().await;
        let key = self.layout.state_key(&state.workspace);
        state
            .locks
            .get(&key)
            .and_then(|held| held.renewal.as_ref())
            .is_some_and(|renewal| !renewal.is_finished())
    }

    async fn read_state(&self, key: &str) -> BackendResult<Option<StateData>> {
        let Some(object) = self.store.get(key).await? else {
            return Ok(None);
        };
        if object.body.is_empty() {
            return Ok(None);
        }
        StateData::from_bytes(object.body.to_vec(), object.meta.last_modified).map(Some)
    }

    async fn read_marker(&self, key: &str) -> BackendResult<Option<LockInfo>> {
        let Some(object) = self.store.get(&lock_key(key)).await? else {
            return Ok(None);
        };
        let info = serde_json::from_slice(&object.body).map_err(|e| {
            BackendError::InvalidState(format!("Failed to parse lock marker: {}", e))
        })?;
        Ok(Some(info))
    }

    async fn read_lease_holder(&self, key: &str) -> BackendResult<Option<LockInfo>> {
        Ok(self
            .store
            .head(key)
            .await?
            .and_then(|meta| lock_from_metadata(&meta.metadata)))
    }

    async fn current_holder(&self, key: &str) -> BackendResult<Option<LockInfo>> {
        match self.store.lock_strategy() {
            LockStrategy::ConditionalCreate => self.read_marker(key).await,
            LockStrategy::Lease => self.read_lease_holder(key).await,
        }
    }

    async fn write_empty_state(&self, key: &str) -> BackendResult<()> {
        let empty = StateData::empty();
        let body = empty.encode()?;
        self.store
            .put(key, Bytes::from(body), &state_metadata(&empty), None)
            .await
    }

    async fn try_lock(&self, info: &LockInfo) -> BackendResult<String> {
        let mut state = self.state.write().await;
        let key = self.layout.state_key(&state.workspace);

        if let Some(held) = state.locks.get(&key) {
            return Err(BackendError::locked(&held.info));
        }

        let held = match self.store.lock_strategy() {
            LockStrategy::ConditionalCreate => self.lock_with_marker(&key, info).await?,
            LockStrategy::Lease => self.lock_with_lease(&key, info).await?,
        };
        let id = held.id.clone();
        log::info!("acquired {} lock {} on {}", self.store.kind(), id, key);
        state.locks.insert(key, held);
        Ok(id)
    }

    async fn lock_with_marker(&self, key: &str, info: &LockInfo) -> BackendResult<HeldLock> {
        let id = info.id_or_generate();
        let mut lock = info.with_id(&id);
        if lock.path.is_empty() {
            lock.path = key.to_string();
        }
        let body = serde_json::to_vec(&lock)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize lock: {}", e)))?;

        if self.store.put_if_absent(&lock_key(key), Bytes::from(body)).await? {
            return Ok(HeldLock {
                id,
                info: lock,
                renewal: None,
            });
        }

        Err(match self.read_marker(key).await? {
            Some(holder) => BackendError::locked(&holder),
            None => unknown_holder(),
        })
    }

    async fn lock_with_lease(&self, key: &str, info: &LockInfo) -> BackendResult<HeldLock> {
        let existing = match self.store.head(key).await? {
            Some(meta) => meta.metadata,
            None => {
                log::debug!("creating empty state at {} before leasing", key);
                let body = StateData::empty().encode()?;
                // Another contender may create and lease it first
                if !self.store.put_if_absent(key, Bytes::from(body)).await? {
                    log::debug!("empty state at {} created concurrently", key);
                }
                self.store
                    .head(key)
                    .await?
                    .map(|meta| meta.metadata)
                    .unwrap_or_default()
            }
        };

        // Lease IDs must be GUIDs on some substrates
        let proposed = uuid::Uuid::parse_str(&info.id)
            .map(|id| id.to_string())
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        let duration = self.store.lease_duration(self.lock_config.lease_duration);

        let Some(lease_id) = self.store.acquire_lease(key, duration, &proposed).await? else {
            return Err(match lock_from_metadata(&existing) {
                Some(holder) => BackendError::locked(&holder),
                None => match self.read_lease_holder(key).await? {
                    Some(holder) => BackendError::locked(&holder),
                    None => unknown_holder(),
                },
            });
        };

        let mut lock = info.with_id(&lease_id);
        if lock.path.is_empty() {
            lock.path = key.to_string();
        }

        let mut metadata = strip_lock_metadata(existing);
        metadata.extend(lock_metadata(&lock));
        if let Err(e) = self.store.set_metadata(key, &metadata, Some(&lease_id)).await {
            if let Err(release) = self.store.release_lease(key, &lease_id).await {
                log::warn!("failed to release lease on {}: {}", key, release);
            }
            return Err(e);
        }

        let renewal = LeaseRenewal::spawn(
            self.store.clone(),
            key.to_string(),
            lease_id.clone(),
            duration / 2,
        );
        Ok(HeldLock {
            id: lease_id,
            info: lock,
            renewal: Some(renewal),
        })
    }

    async fn release(&self, key: &str, held: HeldLock) -> BackendResult<()> {
        match self.store.lock_strategy() {
            LockStrategy::ConditionalCreate => self.store.delete(&lock_key(key)).await,
            LockStrategy::Lease => {
                if let Some(renewal) = &held.renewal {
                    renewal.cancel();
                }
                self.release_lease(key, &held.id).await
            }
        }
    }

    async fn release_lease(&self, key: &str, lease_id: &str) -> BackendResult<()> {
        if let Some(meta) = self.store.head(key).await? {
            let metadata = strip_lock_metadata(meta.metadata);
            self.store.set_metadata(key, &metadata, Some(lease_id)).await?;
        }
        self.store.release_lease(key, lease_id).await
    }
}

#[async_trait]
impl<S: ObjectStore> StateBackend for ObjectStorageBackend<S> {
    async fn pull(&self) -> BackendResult<StateData> {
        let state = self.state.read().await;
        let key = self.layout.state_key(&state.workspace);
        Ok(self.read_state(&key).await?.unwrap_or_else(StateData::empty))
    }

    async fn push(&self, data: &StateData) -> BackendResult<()> {
        let state = self.state.write().await;
        let key = self.layout.state_key(&state.workspace);
        let body = data.encode()?;

        let current = match self.read_state(&key).await {
            Ok(current) => current,
            Err(BackendError::InvalidState(e)) => {
                log::warn!("replacing unreadable state at {}: {}", key, e);
                None
            }
            Err(e) => return Err(e),
        };
        if !check_successor(current.as_ref(), data, &body)? {
            log::debug!("state at {} unchanged, skipping upload", key);
            return Ok(());
        }

        let mut metadata = state_metadata(data);
        let held = state.locks.get(&key);
        if let Some(held) = held.filter(|_| self.store.lock_strategy() == LockStrategy::Lease) {
            metadata.extend(lock_metadata(&held.info));
        }
        let lease_id = held
            .filter(|_| self.store.lock_strategy() == LockStrategy::Lease)
            .map(|held| held.id.as_str());

        self.store
            .put(&key, Bytes::from(body), &metadata, lease_id)
            .await
            .map_err(|e| wrap(e, "push state to", self.store.kind()))
    }

    async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        acquire_with_timeout(&self.lock_config, || self.try_lock(info)).await
    }

    async fn unlock(&self, lock_id: &str) -> BackendResult<()> {
        let mut state = self.state.write().await;

        let held_key = state
            .locks
            .iter()
            .find(|(_, held)| held.id == lock_id)
            .map(|(key, _)| key.clone());
        if let Some(key) = held_key {
            if let Some(held) = state.locks.remove(&key) {
                self.release(&key, held).await?;
                log::info!("released {} lock {} on {}", self.store.kind(), lock_id, key);
            }
            return Ok(());
        }

        let key = self.layout.state_key(&state.workspace);
        if let Some(held) = state.locks.get(&key) {
            return Err(BackendError::LockMismatch {
                expected: held.id.clone(),
                actual: lock_id.to_string(),
            });
        }

        // Held by another instance: defer to what the substrate records
        match (self.store.lock_strategy(), self.current_holder(&key).await?) {
            (_, Some(holder)) if holder.id != lock_id => Err(BackendError::LockMismatch {
                expected: holder.id,
                actual: lock_id.to_string(),
            }),
            (LockStrategy::ConditionalCreate, Some(_)) => self.store.delete(&lock_key(&key)).await,
            (LockStrategy::ConditionalCreate, None) => Ok(()),
            (LockStrategy::Lease, Some(_)) => self.release_lease(&key, lock_id).await,
            (LockStrategy::Lease, None) => self.store.release_lease(&key, lock_id).await,
        }
    }

    async fn get_versions(&self) -> BackendResult<Vec<StateVersion>> {
        let state = self.state.read().await;
        let key = self.layout.state_key(&state.workspace);

        let versions = self
            .store
            .list_versions(&key)
            .await
            .map_err(|e| wrap(e, "list state versions in", self.store.kind()))?;

        Ok(normalize_versions(
            versions
                .into_iter()
                .map(|v| StateVersion {
                    id: v.version_id.clone(),
                    version_id: v.version_id,
                    serial: v.serial.unwrap_or(0),
                    created: v.last_modified,
                    size: v.size,
                    checksum: v.checksum,
                    is_latest: v.is_latest,
                    description: None,
                })
                .collect(),
        ))
    }

    async fn get_version(&self, version_id: &str) -> BackendResult<StateData> {
        if version_id.is_empty() || version_id == "current" {
            return self.pull().await;
        }

        let state = self.state.read().await;
        let key = self.layout.state_key(&state.workspace);
        let object = self
            .store
            .get_version(&key, version_id)
            .await?
            .ok_or_else(|| BackendError::VersionNotFound(version_id.to_string()))?;
        StateData::from_bytes(object.body.to_vec(), object.meta.last_modified)
    }

    async fn list_workspaces(&self) -> BackendResult<Vec<String>> {
        let _state = self.state.read().await;
        let keys = self.store.list(&self.layout.workspaces_prefix()).await?;

        let mut workspaces: BTreeSet<String> = keys
            .iter()
            .filter_map(|key| self.layout.workspace_of(key))
            .collect();
        workspaces.remove(DEFAULT_WORKSPACE);

        let mut names = vec![DEFAULT_WORKSPACE.to_string()];
        names.extend(workspaces);
        Ok(names)
    }

    async fn select_workspace(&self, name: &str) -> BackendResult<()> {
        check_select_workspace(name)?;
        let mut state = self.state.write().await;
        if name != DEFAULT_WORKSPACE
            && self.store.head(&self.layout.state_key(name)).await?.is_none()
        {
            return Err(BackendError::WorkspaceNotFound(name.to_string()));
        }
        state.workspace = name.to_string();
        Ok(())
    }

    async fn create_workspace(&self, name: &str) -> BackendResult<()> {
        check_create_workspace(name)?;
        let _state = self.state.write().await;
        let key = self.layout.state_key(name);

        if self.store.head(&key).await?.is_some() {
            return Err(BackendError::WorkspaceExists(name.to_string()));
        }
        self.write_empty_state(&key).await?;
        log::info!("created workspace {}", name);
        Ok(())
    }

    async fn delete_workspace(&self, name: &str) -> BackendResult<()> {
        let state = self.state.write().await;
        check_delete_workspace(name, &state.workspace)?;
        let key = self.layout.state_key(name);

        if self.store.head(&key).await?.is_none() {
            return Err(BackendError::WorkspaceNotFound(name.to_string()));
        }
        if let Some(held) = state.locks.get(&key) {
            return Err(BackendError::locked(&held.info));
        }
        if let Some(holder) = self.current_holder(&key).await? {
            return Err(BackendError::locked(&holder));
        }

        self.store
            .delete(&key)
            .await
            .map_err(|e| wrap(e, "delete workspace from", self.store.kind()))
    }

    async fn get_lock_info(&self) -> BackendResult<LockInfo> {
        let state = self.state.read().await;
        let key = self.layout.state_key(&state.workspace);

        if let Some(held) = state.locks.get(&key) {
            return Ok(held.info.clone());
        }
        self.current_holder(&key)
            .await?
            .ok_or_else(|| BackendError::LockNotFound(format!("no lock held on {}", key)))
    }

    async fn validate(&self) -> BackendResult<()> {
        self.store.check_access().await
    }

    async fn metadata(&self) -> BackendMetadata {
        let state = self.state.read().await;
        BackendMetadata {
            backend_type: self.store.kind().to_string(),
            supports_locking: true,
            supports_versions: true,
            supports_workspaces: true,
            configuration: self.store.describe(),
            workspace: state.workspace.clone(),
            state_key: self.layout.state_key(&state.workspace),
        }
    }
}

fn lock_key(state_key: &str) -> String {
    format!("{}{}", state_key, LOCK_SUFFIX)
}

fn unknown_holder() -> BackendError {
    BackendError::Locked {
        lock_id: String::new(),
        who: "unknown".to_string(),
        operation: String::new(),
        created: String::new(),
    }
}

/// Prefix substrate client failures with the operation that failed
fn wrap(err: BackendError, action: &str, kind: &str) -> BackendError {
    match err {
        BackendError::Storage { backend, message } => BackendError::Storage {
            message: format!("failed to {} {}: {}", action, backend, message),
            backend,
        },
        BackendError::Io(message) => {
            BackendError::Io(format!("failed to {} {}: {}", action, kind, message))
        }
        other => other,
    }
}

/// Object metadata describing a state body
pub(crate) fn state_metadata(state: &StateData) -> BTreeMap<String, String> {
    BTreeMap::from([
        (META_SERIAL.to_string(), state.serial.to_string()),
        (META_LINEAGE.to_string(), state.lineage.clone()),
        (
            META_TERRAFORM_VERSION.to_string(),
            state.terraform_version.clone(),
        ),
    ])
}

fn lock_metadata(lock: &LockInfo) -> BTreeMap<String, String> {
    BTreeMap::from([
        (META_LOCK_ID.to_string(), lock.id.clone()),
        (META_LOCK_OPERATION.to_string(), lock.operation.clone()),
        (META_LOCK_WHO.to_string(), lock.who.clone()),
        (META_LOCK_CREATED.to_string(), format_time(&lock.created)),
    ])
}

fn strip_lock_metadata(mut metadata: BTreeMap<String, String>) -> BTreeMap<String, String> {
    metadata.retain(|k, _| !k.starts_with("lock_"));
    metadata
}

fn lock_from_metadata(metadata: &BTreeMap<String, String>) -> Option<LockInfo> {
    let id = metadata.get(META_LOCK_ID)?;
    let created = metadata
        .get(META_LOCK_CREATED)
        .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        .map(|c| c.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Some(LockInfo {
        id: id.clone(),
        path: String::new(),
        operation: metadata.get(META_LOCK_OPERATION).cloned().unwrap_or_default(),
        who: metadata.get(META_LOCK_WHO).cloned().unwrap_or_default(),
        version: String::new(),
        created,
        info: String::new(),
    })
}
