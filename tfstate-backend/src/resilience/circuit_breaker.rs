//! Circuit breaker guarding a single backend
//!
//! ```text
//! Closed --failure_threshold--> Open --recovery_timeout--> HalfOpen
//!   ^                            ^                            |
//!   |                            +-----trial call fails-------+
//!   +---------------success_threshold met---------------------+
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    /// Calls are rejected until `until`
    Open { until: Instant },
    /// Up to `half_open_success_threshold` trial calls test recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open { .. } => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before the circuit opens
    pub failure_threshold: u32,
    #[serde(with = "crate::config::duration_ms")]
    pub recovery_timeout: Duration,
    /// Successful trial calls needed to close the circuit again
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    /// Trial calls admitted since the circuit went half-open
    half_open_admitted: u32,
    half_open_since: Instant,
    rejected: u64,
}

/// Thread-safe circuit breaker, cheap to clone
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<Inner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: Arc::from(name.into()),
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_admitted: 0,
                half_open_since: Instant::now(),
                rejected: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call may proceed; moves an expired open circuit to half-open
    ///
    /// A half-open circuit admits at most `half_open_success_threshold`
    /// trial calls. If they have not all reported back within
    /// `recovery_timeout`, a fresh round of trial calls is admitted.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                let cap = self.config.half_open_success_threshold.max(1);
                if inner.half_open_admitted >= cap
                    && now >= inner.half_open_since + self.config.recovery_timeout
                {
                    log::debug!("circuit breaker {} trial calls timed out", self.name);
                    inner.half_open_admitted = 0;
                    inner.half_open_since = now;
                }
                if inner.half_open_admitted < cap {
                    inner.half_open_admitted += 1;
                    true
                } else {
                    inner.rejected += 1;
                    false
                }
            }
            CircuitState::Open { until } if now >= until => {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                inner.half_open_admitted = 1;
                inner.half_open_since = now;
                log::info!("circuit breaker {} half-open, admitting trial calls", self.name);
                true
            }
            CircuitState::Open { .. } => {
                inner.rejected += 1;
                false
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.half_open_admitted = 0;
                    log::info!("circuit breaker {} closed", self.name);
                }
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Record a transient failure
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open {
                        until: Instant::now() + self.config.recovery_timeout,
                    };
                    log::warn!(
                        "circuit breaker {} opened after {} consecutive failures",
                        self.name,
                        inner.consecutive_failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open {
                    until: Instant::now() + self.config.recovery_timeout,
                };
                inner.half_open_successes = 0;
                inner.half_open_admitted = 0;
                log::warn!("circuit breaker {} re-opened after failed trial call", self.name);
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Current state; an expired open circuit reads as half-open
    pub fn state(&self) -> CircuitState {
        match self.inner.lock().state {
            CircuitState::Open { until } if Instant::now() >= until => CircuitState::HalfOpen,
            other => other,
        }
    }

    /// Number of calls refused while open
    pub fn rejected_count(&self) -> u64 {
        self.inner.lock().rejected
    }
}
