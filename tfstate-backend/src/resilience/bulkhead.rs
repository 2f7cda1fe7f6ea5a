//! Concurrency limiter for in-flight backend calls

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::backend::{BackendError, BackendResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    /// How long a caller waits for a slot before `CapacityExceeded`
    #[serde(with = "crate::config::duration_ms")]
    pub max_wait: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_wait: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Bulkhead {
    limit: usize,
    max_wait: Duration,
    slots: Arc<Semaphore>,
}

impl Bulkhead {
    pub fn new(config: &BulkheadConfig) -> Self {
        let limit = config.max_concurrent.max(1);
        Self {
            limit,
            max_wait: config.max_wait,
            slots: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Take a slot; the call stays admitted until the permit is dropped
    pub async fn acquire(&self) -> BackendResult<OwnedSemaphorePermit> {
        if let Ok(permit) = self.slots.clone().try_acquire_owned() {
            return Ok(permit);
        }
        match tokio::time::timeout(self.max_wait, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            _ => Err(BackendError::CapacityExceeded { limit: self.limit }),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.limit - self.slots.available_permits()
    }
}
