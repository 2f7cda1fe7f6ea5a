//! Resilience wrapper for state backends
//!
//! [`ResilientBackend`] runs every call through, in order: an optional rate
//! limiter, a bulkhead, and a retry loop with the circuit breaker consulted
//! before each attempt. Only transient errors are retried; rejections from
//! any of these layers are returned as is.

mod bulkhead;
mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use bulkhead::{Bulkhead, BulkheadConfig};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use retry::{RetryPolicy, RetryPredicate};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendMetadata, BackendResult, StateBackend};
use crate::config::{BackendConfig, RetryConfig};
use crate::lock::LockInfo;
use crate::state::{StateData, StateVersion};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub circuit: CircuitBreakerConfig,
    pub bulkhead: BulkheadConfig,
    pub rate_limit: Option<RateLimitConfig>,
    /// Deadline for a single attempt
    #[serde(skip)]
    pub call_timeout: Option<Duration>,
}

impl From<&BackendConfig> for ResilienceConfig {
    fn from(config: &BackendConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            ..Self::default()
        }
    }
}

/// A backend whose calls are rate limited, bulkheaded, retried and circuit broken
pub struct ResilientBackend<B> {
    inner: B,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    bulkhead: Bulkhead,
    rate_limiter: Option<RateLimiter>,
    call_timeout: Option<Duration>,
}

impl<B: StateBackend> ResilientBackend<B> {
    pub fn new(inner: B, name: impl Into<String>, config: ResilienceConfig) -> Self {
        Self {
            inner,
            retry: RetryPolicy::new(config.retry),
            breaker: CircuitBreaker::new(name, config.circuit),
            bulkhead: Bulkhead::new(&config.bulkhead),
            rate_limiter: config.rate_limit.map(RateLimiter::new),
            call_timeout: config.call_timeout,
        }
    }

    /// Replace the default transient-only retry predicate
    pub fn with_retry_predicate(
        mut self,
        predicate: impl Fn(&BackendError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry = self.retry.with_predicate(predicate);
        self
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, mut op: F) -> BackendResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        if let Some(limiter) = &self.rate_limiter {
            limiter.try_acquire()?;
        }
        let _permit = self.bulkhead.acquire().await?;

        let call_timeout = self.call_timeout;
        self.retry
            .run(operation, Some(&self.breaker), || {
                let attempt = op();
                async move {
                    match call_timeout {
                        Some(limit) => tokio::time::timeout(limit, attempt).await.map_err(|_| {
                            BackendError::Timeout(format!("{} exceeded {:?}", operation, limit))
                        })?,
                        None => attempt.await,
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl<B: StateBackend> StateBackend for ResilientBackend<B> {
    async fn pull(&self) -> BackendResult<StateData> {
        self.call("pull", || self.inner.pull()).await
    }

    async fn push(&self, state: &StateData) -> BackendResult<()> {
        self.call("push", || self.inner.push(state)).await
    }

    async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        self.call("lock", || self.inner.lock(info)).await
    }

    async fn unlock(&self, lock_id: &str) -> BackendResult<()> {
        self.call("unlock", || self.inner.unlock(lock_id)).await
    }

    async fn get_versions(&self) -> BackendResult<Vec<StateVersion>> {
        self.call("get_versions", || self.inner.get_versions()).await
    }

    async fn get_version(&self, version_id: &str) -> BackendResult<StateData> {
        self.call("get_version", || self.inner.get_version(version_id))
            .await
    }

    async fn list_workspaces(&self) -> BackendResult<Vec<String>> {
        self.call("list_workspaces", || self.inner.list_workspaces())
            .await
    }

    async fn select_workspace(&self, name: &str) -> BackendResult<()> {
        self.call("select_workspace", || self.inner.select_workspace(name))
            .await
    }

    async fn create_workspace(&self, name: &str) -> BackendResult<()> {
        self.call("create_workspace", || self.inner.create_workspace(name))
            .await
    }

    async fn delete_workspace(&self, name: &str) -> BackendResult<()> {
        self.call("delete_workspace", || self.inner.delete_workspace(name))
            .await
    }

    async fn get_lock_info(&self) -> BackendResult<LockInfo> {
        self.call("get_lock_info", || self.inner.get_lock_info())
            .await
    }

    async fn validate(&self) -> BackendResult<()> {
        self.call("validate", || self.inner.validate()).await
    }

    async fn metadata(&self) -> BackendMetadata {
        self.inner.metadata().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::object::{MemoryObjectStore, ObjectStorageBackend};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn fast_config() -> ResilienceConfig {
        ResilienceConfig {
            retry: RetryConfig {
                max_retries: 3,
                retry_delay: Duration::from_millis(10),
                retry_backoff: 2.0,
                max_delay: Duration::from_secs(1),
                jitter: 0.3,
            },
            ..ResilienceConfig::default()
        }
    }

    fn memory_backend(store: MemoryObjectStore) -> ObjectStorageBackend<MemoryObjectStore> {
        ObjectStorageBackend::new(store, "terraform.tfstate", &BackendConfig::new("memory"))
    }

    #[tokio::test]
    async fn test_retries_transient_store_failures() {
        let store = MemoryObjectStore::new();
        store.fail_next(2, || BackendError::Unavailable("injected".into()));
        let backend = ResilientBackend::new(memory_backend(store.clone()), "memory", fast_config());

        let start = Instant::now();
        let state = backend.pull().await.unwrap();
        assert_eq!(state.serial, 0);
        // 10ms + 20ms of backoff
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(backend.circuit_breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_conflicts_are_not_retried() {
        let backend = ResilientBackend::new(
            memory_backend(MemoryObjectStore::new()),
            "memory",
            fast_config(),
        );

        let err = backend.select_workspace("nope").await.unwrap_err();
        assert!(matches!(err, BackendError::WorkspaceNotFound(_)));

        let first = LockInfo::new("apply");
        backend.lock(&first).await.unwrap();
        let start = Instant::now();
        let err = backend.lock(&LockInfo::new("plan")).await.unwrap_err();
        assert!(matches!(err, BackendError::Locked { .. }));
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_circuit_opens_and_rejects() {
        let store = MemoryObjectStore::new();
        store.fail_next(100, || BackendError::Unavailable("injected".into()));
        let config = ResilienceConfig {
            retry: RetryConfig {
                max_retries: 0,
                ..fast_config().retry
            },
            circuit: CircuitBreakerConfig {
                failure_threshold: 2,
                ..CircuitBreakerConfig::default()
            },
            ..fast_config()
        };
        let backend = ResilientBackend::new(memory_backend(store), "memory", config);

        assert!(matches!(backend.pull().await, Err(BackendError::Unavailable(_))));
        assert!(matches!(backend.pull().await, Err(BackendError::Unavailable(_))));
        assert!(matches!(backend.pull().await, Err(BackendError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let config = ResilienceConfig {
            rate_limit: Some(RateLimitConfig {
                rate: 0.5,
                burst: 1,
            }),
            ..fast_config()
        };
        let backend = ResilientBackend::new(
            memory_backend(MemoryObjectStore::new()),
            "memory",
            config,
        );

        backend.pull().await.unwrap();
        assert!(matches!(
            backend.pull().await,
            Err(BackendError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_custom_predicate_and_call_timeout() {
        let store = MemoryObjectStore::new();
        store.set_latency(Duration::from_millis(200));
        let config = ResilienceConfig {
            call_timeout: Some(Duration::from_millis(20)),
            ..fast_config()
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let backend = ResilientBackend::new(memory_backend(store), "memory", config)
            .with_retry_predicate(move |e| {
                counter.fetch_add(1, Ordering::SeqCst);
                matches!(e, BackendError::Timeout(_))
            });

        let err = backend.pull().await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
        // Consulted once per failed attempt: the first try plus three retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
