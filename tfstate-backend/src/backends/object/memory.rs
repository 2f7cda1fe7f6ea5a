//! In-memory object store
//!
//! Keeps a full generation history per key and supports both lock
//! strategies. Used for dry runs and as a test double (with failure
//! injection and artificial latency).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{LockStrategy, META_SERIAL, ObjectMeta, ObjectStore, ObjectVersion, StoredObject};
use crate::backend::{BackendError, BackendResult};
use crate::state::compute_checksum;

type FailureFn = Box<dyn Fn() -> BackendError + Send + Sync>;

#[derive(Debug, Clone)]
struct Generation {
    generation: u64,
    body: Bytes,
    metadata: BTreeMap<String, String>,
    created: DateTime<Utc>,
}

#[derive(Debug)]
struct Lease {
    id: String,
    expires: Instant,
    duration: Duration,
}

#[derive(Default)]
struct Objects {
    history: BTreeMap<String, Vec<Generation>>,
    leases: HashMap<String, Lease>,
    next_generation: u64,
}

impl Objects {
    fn current(&self, key: &str) -> Option<&Generation> {
        self.history.get(key).and_then(|h| h.last())
    }

    fn active_lease(&self, key: &str) -> Option<&Lease> {
        self.leases
            .get(key)
            .filter(|lease| lease.expires > Instant::now())
    }

    fn check_lease(&self, key: &str, lease_id: Option<&str>) -> BackendResult<()> {
        match (self.active_lease(key), lease_id) {
            (Some(lease), Some(id)) if lease.id == id => Ok(()),
            (Some(_), _) => Err(BackendError::storage(
                "memory",
                format!("{} is leased and the request carries no matching lease", key),
            )),
            (None, _) => Ok(()),
        }
    }

    fn append(&mut self, key: &str, body: Bytes, metadata: BTreeMap<String, String>) {
        self.next_generation += 1;
        let generation = Generation {
            generation: self.next_generation,
            body,
            metadata,
            created: Utc::now(),
        };
        self.history
            .entry(key.to_string())
            .or_default()
            .push(generation);
    }
}

struct Inner {
    strategy: LockStrategy,
    objects: Mutex<Objects>,
    failures: Mutex<Option<(u32, FailureFn)>>,
    latency: Mutex<Duration>,
    max_lease: Mutex<Option<Duration>>,
}

/// A process-local object store; clones share the same contents
#[derive(Clone)]
pub struct MemoryObjectStore {
    inner: Arc<Inner>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    /// A store locking with conditional-create markers
    pub fn new() -> Self {
        Self::with_strategy(LockStrategy::ConditionalCreate)
    }

    /// A store locking with leases on the state object
    pub fn with_leases() -> Self {
        Self::with_strategy(LockStrategy::Lease)
    }

    fn with_strategy(strategy: LockStrategy) -> Self {
        Self {
            inner: Arc::new(Inner {
                strategy,
                objects: Mutex::new(Objects::default()),
                failures: Mutex::new(None),
                latency: Mutex::new(Duration::ZERO),
                max_lease: Mutex::new(None),
            }),
        }
    }

    /// Make the next `count` store calls fail with the error built by `make`
    pub fn fail_next(&self, count: u32, make: impl Fn() -> BackendError + Send + Sync + 'static) {
        *self.inner.failures.lock() = Some((count, Box::new(make)));
    }

    /// Delay every store call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Grant leases of at most `max`, whatever the caller asks for
    pub fn set_max_lease(&self, max: Duration) {
        *self.inner.max_lease.lock() = Some(max);
    }

    async fn enter(&self) -> BackendResult<()> {
        let latency = *self.inner.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut failures = self.inner.failures.lock();
        if let Some((remaining, make)) = failures.as_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(make());
            }
        }
        Ok(())
    }
}

fn to_stored(generation: &Generation) -> StoredObject {
    StoredObject {
        body: generation.body.clone(),
        meta: to_meta(generation),
    }
}

fn to_meta(generation: &Generation) -> ObjectMeta {
    ObjectMeta {
        size: generation.body.len() as u64,
        last_modified: generation.created,
        metadata: generation.metadata.clone(),
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn lock_strategy(&self) -> LockStrategy {
        self.inner.strategy
    }

    fn lease_duration(&self, requested: Duration) -> Duration {
        match *self.inner.max_lease.lock() {
            Some(max) => requested.min(max),
            None => requested,
        }
    }

    fn describe(&self) -> BTreeMap<String, String> {
        let strategy = match self.inner.strategy {
            LockStrategy::Lease => "lease",
            LockStrategy::ConditionalCreate => "conditional_create",
        };
        BTreeMap::from([("lock_strategy".to_string(), strategy.to_string())])
    }

    async fn get(&self, key: &str) -> BackendResult<Option<StoredObject>> {
        self.enter().await?;
        Ok(self.inner.objects.lock().current(key).map(to_stored))
    }

    async fn get_version(
        &self,
        key: &str,
        version_id: &str,
    ) -> BackendResult<Option<StoredObject>> {
        self.enter().await?;
        let Ok(wanted) = version_id.parse::<u64>() else {
            return Ok(None);
        };
        let objects = self.inner.objects.lock();
        Ok(objects
            .history
            .get(key)
            .and_then(|h| h.iter().find(|g| g.generation == wanted))
            .map(to_stored))
    }

    async fn head(&self, key: &str) -> BackendResult<Option<ObjectMeta>> {
        self.enter().await?;
        Ok(self.inner.objects.lock().current(key).map(to_meta))
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: &BTreeMap<String, String>,
        lease_id: Option<&str>,
    ) -> BackendResult<()> {
        self.enter().await?;
        let mut objects = self.inner.objects.lock();
        objects.check_lease(key, lease_id)?;
        objects.append(key, body, metadata.clone());
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, body: Bytes) -> BackendResult<bool> {
        self.enter().await?;
        let mut objects = self.inner.objects.lock();
        if objects.current(key).is_some() {
            return Ok(false);
        }
        objects.append(key, body, BTreeMap::new());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.enter().await?;
        let mut objects = self.inner.objects.lock();
        objects.check_lease(key, None)?;
        objects.history.remove(key);
        objects.leases.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> BackendResult<Vec<String>> {
        self.enter().await?;
        let objects = self.inner.objects.lock();
        Ok(objects
            .history
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn list_versions(&self, key: &str) -> BackendResult<Vec<ObjectVersion>> {
        self.enter().await?;
        let objects = self.inner.objects.lock();
        let Some(history) = objects.history.get(key) else {
            return Ok(Vec::new());
        };

        let latest = history.len().saturating_sub(1);
        Ok(history
            .iter()
            .enumerate()
            .rev()
            .map(|(i, g)| ObjectVersion {
                version_id: g.generation.to_string(),
                size: g.body.len() as u64,
                last_modified: g.created,
                is_latest: i == latest,
                serial: g.metadata.get(META_SERIAL).and_then(|s| s.parse().ok()),
                checksum: compute_checksum(&g.body),
            })
            .collect())
    }

    async fn check_access(&self) -> BackendResult<()> {
        self.enter().await
    }

    async fn acquire_lease(
        &self,
        key: &str,
        duration: Duration,
        lease_id: &str,
    ) -> BackendResult<Option<String>> {
        self.enter().await?;
        let duration = self.lease_duration(duration);
        let mut objects = self.inner.objects.lock();
        if objects.current(key).is_none() {
            return Err(BackendError::storage(
                "memory",
                format!("cannot lease missing object {}", key),
            ));
        }
        if objects.active_lease(key).is_some() {
            return Ok(None);
        }
        objects.leases.insert(
            key.to_string(),
            Lease {
                id: lease_id.to_string(),
                expires: Instant::now() + duration,
                duration,
            },
        );
        Ok(Some(lease_id.to_string()))
    }

    async fn renew_lease(&self, key: &str, lease_id: &str) -> BackendResult<()> {
        self.enter().await?;
        let mut objects = self.inner.objects.lock();
        match objects.leases.get_mut(key) {
            Some(lease) if lease.id == lease_id && lease.expires > Instant::now() => {
                lease.expires = Instant::now() + lease.duration;
                Ok(())
            }
            _ => Err(BackendError::storage(
                "memory",
                format!("lease {} on {} has been lost", lease_id, key),
            )),
        }
    }

    async fn release_lease(&self, key: &str, lease_id: &str) -> BackendResult<()> {
        self.enter().await?;
        let mut objects = self.inner.objects.lock();
        match objects.active_lease(key) {
            None => Err(BackendError::LockNotFound(format!("no lease held on {}", key))),
            Some(lease) if lease.id != lease_id => Err(BackendError::LockMismatch {
                expected: lease.id.clone(),
                actual: lease_id.to_string(),
            }),
            Some(_) => {
                objects.leases.remove(key);
                Ok(())
            }
        }
    }

    async fn set_metadata(
        &self,
        key: &str,
        metadata: &BTreeMap<String, String>,
        lease_id: Option<&str>,
    ) -> BackendResult<()> {
        self.enter().await?;
        let mut objects = self.inner.objects.lock();
        objects.check_lease(key, lease_id)?;
        match objects.history.get_mut(key).and_then(|h| h.last_mut()) {
            Some(current) => {
                current.metadata = metadata.clone();
                Ok(())
            }
            None => Err(BackendError::storage(
                "memory",
                format!("object {} not found", key),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generations_and_conditional_create() {
        let store = MemoryObjectStore::new();
        store
            .put("a", Bytes::from_static(b"1"), &BTreeMap::new(), None)
            .await
            .unwrap();
        store
            .put("a", Bytes::from_static(b"2"), &BTreeMap::new(), None)
            .await
            .unwrap();

        let versions = store.list_versions("a").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[0].is_latest);
        let first = store
            .get_version("a", &versions[1].version_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.body, Bytes::from_static(b"1"));

        assert!(store.put_if_absent("b", Bytes::new()).await.unwrap());
        assert!(!store.put_if_absent("b", Bytes::new()).await.unwrap());
        assert_eq!(store.list("").await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_lease_expiry_and_guarded_writes() {
        let store = MemoryObjectStore::with_leases();
        store
            .put("s", Bytes::from_static(b"{}"), &BTreeMap::new(), None)
            .await
            .unwrap();

        let id = store
            .acquire_lease("s", Duration::from_millis(30), "lease-1")
            .await
            .unwrap()
            .unwrap();
        assert!(
            store
                .acquire_lease("s", Duration::from_millis(30), "lease-2")
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .put("s", Bytes::new(), &BTreeMap::new(), None)
                .await
                .is_err()
        );
        assert!(
            store
                .put("s", Bytes::new(), &BTreeMap::new(), Some(&id))
                .await
                .is_ok()
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.renew_lease("s", &id).await.is_err());
        assert!(
            store
                .acquire_lease("s", Duration::from_millis(30), "lease-2")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryObjectStore::new();
        store.fail_next(1, || BackendError::Timeout("injected".into()));
        assert!(store.get("x").await.is_err());
        assert!(store.get("x").await.unwrap().is_none());
    }
}
