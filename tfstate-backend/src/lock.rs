//! Lock information for state backend locking

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backend::{BackendError, BackendResult};
use crate::config::LockConfig;

/// Information about a state lock
///
/// Serialized with Terraform's field names so lock files and lock markers
/// written here can be read by Terraform itself and vice versa.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock
    #[serde(rename = "ID")]
    pub id: String,
    /// State object the lock protects
    #[serde(rename = "Path", default)]
    pub path: String,
    /// The operation being performed (e.g., "apply", "destroy", "plan")
    #[serde(rename = "Operation")]
    pub operation: String,
    /// Who acquired the lock (username@hostname)
    #[serde(rename = "Who")]
    pub who: String,
    /// Version of the tool holding the lock
    #[serde(rename = "Version", default)]
    pub version: String,
    /// When the lock was created
    #[serde(rename = "Created")]
    pub created: DateTime<Utc>,
    /// Free-form note from the holder
    #[serde(rename = "Info", default)]
    pub info: String,
}

impl LockInfo {
    /// Create a new lock for an operation
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            path: String::new(),
            operation: operation.into(),
            who: get_lock_owner(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created: Utc::now(),
            info: String::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    pub fn with_who(mut self, who: impl Into<String>) -> Self {
        self.who = who.into();
        self
    }

    /// Copy of this lock carrying the given ID
    pub(crate) fn with_id(&self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..self.clone()
        }
    }

    /// The caller-supplied ID, or a fresh one when the caller left it empty
    pub(crate) fn id_or_generate(&self) -> String {
        if self.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            self.id.clone()
        }
    }
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}

/// Run `attempt` until it stops reporting a held lock or `lock_timeout` runs out
///
/// With the default zero timeout the first result is returned as is.
pub(crate) async fn acquire_with_timeout<F, Fut>(
    config: &LockConfig,
    mut attempt: F,
) -> BackendResult<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<String>>,
{
    let deadline = Instant::now() + config.lock_timeout;
    loop {
        match attempt().await {
            Err(BackendError::Locked { who, .. })
                if Instant::now() + config.lock_retry_delay <= deadline =>
            {
                log::debug!(
                    "state locked by {}, retrying in {:?}",
                    who,
                    config.lock_retry_delay
                );
                tokio::time::sleep(config.lock_retry_delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_lock_info_new() {
        let lock = LockInfo::new("apply");
        assert_eq!(lock.operation, "apply");
        assert!(!lock.id.is_empty());
        assert!(!lock.who.is_empty());
        assert_eq!(lock.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_lock_owner_format() {
        let who = get_lock_owner();
        assert!(who.contains('@'));
    }

    #[test]
    fn test_lock_info_serialization() {
        let lock = LockInfo::new("apply")
            .with_path("terraform.tfstate")
            .with_info("nightly run");
        let json = serde_json::to_string_pretty(&lock).unwrap();
        assert!(json.contains("\"ID\""));
        assert!(json.contains("\"Operation\": \"apply\""));

        let deserialized: LockInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, lock);
    }

    #[test]
    fn test_lock_info_reads_terraform_lock_file() {
        let json = r#"{
            "ID": "0b5c5c97-8b3f-4e5e-a0a3-4a3f0e2d9d10",
            "Operation": "OperationTypeApply",
            "Info": "",
            "Who": "alice@laptop",
            "Version": "1.7.5",
            "Created": "2024-05-01T10:00:00.123456Z",
            "Path": "terraform.tfstate"
        }"#;
        let lock: LockInfo = serde_json::from_str(json).unwrap();
        assert_eq!(lock.who, "alice@laptop");
        assert_eq!(lock.path, "terraform.tfstate");
    }

    #[test]
    fn test_id_or_generate() {
        let mut lock = LockInfo::new("plan");
        assert_eq!(lock.id_or_generate(), lock.id);
        lock.id.clear();
        assert!(!lock.id_or_generate().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_without_timeout_fails_fast() {
        let config = LockConfig::default();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let holder = LockInfo::new("apply");

        let result = acquire_with_timeout(&config, || {
            counter.fetch_add(1, Ordering::SeqCst);
            let err = BackendError::locked(&holder);
            async move { Err(err) }
        })
        .await;

        assert!(matches!(result, Err(BackendError::Locked { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_retries_until_released() {
        let config = LockConfig {
            lock_timeout: Duration::from_millis(500),
            lock_retry_delay: Duration::from_millis(10),
            ..LockConfig::default()
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let holder = LockInfo::new("apply");

        let result = acquire_with_timeout(&config, || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let err = BackendError::locked(&holder);
            async move {
                if n < 2 {
                    Err(err)
                } else {
                    Ok("lock-1".to_string())
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "lock-1");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
