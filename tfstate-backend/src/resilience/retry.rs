//! Retry with exponential backoff and jitter
//!
//! The delay before retry `n` (zero-based) is
//! `retry_delay * retry_backoff^n`, capped at `max_delay`, plus a random
//! extra of up to `jitter` times that value.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::circuit_breaker::CircuitBreaker;
use crate::backend::{BackendError, BackendResult, ErrorCategory};
use crate::config::RetryConfig;

/// Decides whether an error is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&BackendError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    predicate: RetryPredicate,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Retry transient errors only
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            predicate: Arc::new(BackendError::is_retryable),
        }
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&BackendError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Rejections from the resilience layer itself are never retried
    pub fn should_retry(&self, err: &BackendError) -> bool {
        err.category() != ErrorCategory::Rejected && (self.predicate)(err)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        compute_backoff(&self.config, attempt)
    }

    /// Run `operation` until it succeeds, fails permanently or retries run out
    ///
    /// The breaker, if given, is consulted before every attempt. An open
    /// circuit ends the loop at once with [`BackendError::CircuitOpen`].
    pub async fn run<F, Fut, T>(
        &self,
        operation_name: &str,
        breaker: Option<&CircuitBreaker>,
        mut operation: F,
    ) -> BackendResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let mut attempt = 0;
        loop {
            if let Some(cb) = breaker {
                if !cb.allow_request() {
                    return Err(BackendError::CircuitOpen(cb.name().to_string()));
                }
            }

            match operation().await {
                Ok(value) => {
                    if let Some(cb) = breaker {
                        cb.record_success();
                    }
                    if attempt > 0 {
                        log::debug!("{} succeeded after {} retries", operation_name, attempt);
                    }
                    return Ok(value);
                }
                Err(err) if self.should_retry(&err) => {
                    if let Some(cb) = breaker {
                        cb.record_failure();
                    }
                    if attempt >= self.config.max_retries {
                        log::warn!(
                            "{} failed after {} attempts: {}",
                            operation_name,
                            attempt + 1,
                            err
                        );
                        return Err(err);
                    }
                    let delay = self.backoff(attempt);
                    log::debug!(
                        "{} attempt {} failed ({}), retrying in {:?}",
                        operation_name,
                        attempt + 1,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    // A permanent error still proves the substrate answered
                    if let Some(cb) = breaker {
                        cb.record_success();
                    }
                    return Err(err);
                }
            }
        }
    }
}

pub(crate) fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let multiplier = if config.retry_backoff.is_finite() {
        config.retry_backoff.max(1.0)
    } else {
        1.0
    };
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = config.retry_delay.as_secs_f64() * multiplier.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter = config.jitter.clamp(0.0, 1.0);
    let extra = if capped > 0.0 && jitter > 0.0 {
        rand::thread_rng().gen_range(0.0..=capped * jitter)
    } else {
        0.0
    };
    Duration::from_secs_f64(capped + extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn config(max_retries: u32, delay_ms: u64) -> RetryConfig {
        RetryConfig {
            max_retries,
            retry_delay: Duration::from_millis(delay_ms),
            retry_backoff: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: 0.3,
        }
    }

    #[test]
    fn test_compute_backoff_exponential() {
        let cfg = config(3, 100);
        for attempt in 0..3 {
            let expected = 100.0 * 2f64.powi(attempt as i32);
            let d = compute_backoff(&cfg, attempt).as_secs_f64() * 1000.0;
            assert!(d >= expected - 0.001, "attempt {}: {}", attempt, d);
            assert!(d <= expected * 1.3 + 0.001, "attempt {}: {}", attempt, d);
        }
    }

    #[test]
    fn test_compute_backoff_capped() {
        let cfg = config(20, 100);
        let d = compute_backoff(&cfg, 15);
        assert!(d >= Duration::from_secs(1));
        assert!(d <= Duration::from_millis(1300));
    }

    #[test]
    fn test_compute_backoff_without_jitter() {
        let cfg = RetryConfig {
            jitter: 0.0,
            ..config(3, 50)
        };
        assert_eq!(compute_backoff(&cfg, 1), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(config(3, 20));
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result = policy
            .run("pull", None, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(BackendError::Unavailable("503".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 20ms + 40ms of backoff
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_non_retryable_error_single_attempt() {
        let policy = RetryPolicy::new(config(3, 1));
        let calls = AtomicU32::new(0);

        let result: BackendResult<()> = policy
            .run("select_workspace", None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::WorkspaceNotFound("qa".into())) }
            })
            .await;

        assert!(matches!(result, Err(BackendError::WorkspaceNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_error() {
        let policy = RetryPolicy::new(config(2, 1));
        let calls = AtomicU32::new(0);

        let result: BackendResult<()> = policy
            .run("push", None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::Timeout("upload".into())) }
            })
            .await;

        assert!(matches!(result, Err(BackendError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let policy = RetryPolicy::new(config(2, 1))
            .with_predicate(|e| matches!(e, BackendError::Locked { .. }));
        let calls = AtomicU32::new(0);
        let holder = crate::lock::LockInfo::new("apply");

        let _: BackendResult<()> = policy
            .run("lock", None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                let err = BackendError::locked(&holder);
                async move { Err(err) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_open_circuit_is_not_retried() {
        let policy = RetryPolicy::new(config(5, 1));
        let cb = CircuitBreaker::new(
            "s3",
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..CircuitBreakerConfig::default()
            },
        );
        let calls = AtomicU32::new(0);

        let result: BackendResult<()> = policy
            .run("pull", Some(&cb), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::Unavailable("down".into())) }
            })
            .await;

        assert!(matches!(result, Err(BackendError::CircuitOpen(name)) if name == "s3"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
