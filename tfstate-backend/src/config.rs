//! Backend configuration

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendResult, DEFAULT_WORKSPACE};

/// Configuration for a state backend
///
/// ```
/// use tfstate_backend::BackendConfig;
///
/// let config: BackendConfig = serde_json::from_str(r#"{
///     "type": "s3",
///     "attributes": { "bucket": "my-state", "key": "prod/terraform.tfstate" },
///     "retry": { "max_retries": 5 }
/// }"#).unwrap();
/// assert_eq!(config.retry.max_retries, 5);
/// assert_eq!(config.workspace(), "default");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend type (e.g., "s3", "gcs", "local")
    #[serde(rename = "type")]
    pub backend_type: String,
    /// Backend-specific attributes
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

impl BackendConfig {
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            ..Self::default()
        }
    }

    /// Builder-style attribute setter
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Get a string attribute value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get a string attribute or fail with a configuration error naming it
    pub fn require_string(&self, key: &str) -> BackendResult<&str> {
        self.get_string(key).ok_or_else(|| {
            BackendError::configuration(format!("Missing required attribute: {}", key))
        })
    }

    /// Get a boolean attribute value
    ///
    /// Accepts JSON booleans and the strings "true"/"false".
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.attributes.get(key) {
            Some(serde_json::Value::Bool(b)) => Some(*b),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Get a boolean attribute with a default value
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Workspace selected at construction
    pub fn workspace(&self) -> &str {
        self.get_string("workspace").unwrap_or(DEFAULT_WORKSPACE)
    }
}

/// Connection pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_idle_connections: usize,
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// How long `get` waits for a free slot before giving up
    #[serde(with = "duration_ms")]
    pub wait_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_idle_connections: 5,
            idle_timeout: Duration::from_secs(30 * 60),
            wait_timeout: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Retry sizing for the resilience wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    /// Multiplier applied to the delay after each retry
    pub retry_backoff: f64,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the computed delay
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            retry_backoff: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.3,
        }
    }
}

/// Lock acquisition sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long `lock` keeps retrying a held lock; zero fails immediately
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub lock_retry_delay: Duration,
    /// Lease length for lease-based substrates
    #[serde(with = "duration_ms")]
    pub lease_duration: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::ZERO,
            lock_retry_delay: Duration::from_secs(1),
            lease_duration: Duration::from_secs(60),
        }
    }
}

/// Serialize a `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_string_and_require() {
        let config = BackendConfig::new("s3")
            .with_attribute("bucket", "state")
            .with_attribute("key", "");

        assert_eq!(config.get_string("bucket"), Some("state"));
        // Empty strings count as missing
        assert_eq!(config.get_string("key"), None);

        let err = config.require_string("key").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Backend configuration error: Missing required attribute: key"
        );
    }

    #[test]
    fn test_get_bool() {
        let config = BackendConfig::new("s3")
            .with_attribute("encrypt", false)
            .with_attribute("skip_validation", "true");

        assert_eq!(config.get_bool("encrypt"), Some(false));
        assert!(config.get_bool_or("skip_validation", false));
        assert!(config.get_bool_or("missing", true));
    }

    #[test]
    fn test_workspace_default() {
        assert_eq!(BackendConfig::new("local").workspace(), "default");
        let config = BackendConfig::new("local").with_attribute("workspace", "staging");
        assert_eq!(config.workspace(), "staging");
    }

    #[test]
    fn test_tuning_roundtrip_in_millis() {
        let json = r#"{"type": "local", "pool": {"idle_timeout": 1500}, "lock": {"lock_timeout": 250}}"#;
        let config: BackendConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.pool.idle_timeout, Duration::from_millis(1500));
        assert_eq!(config.pool.max_connections, 10);
        assert_eq!(config.lock.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.retry, RetryConfig::default());

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["pool"]["idle_timeout"], 1500);
        assert_eq!(value["type"], "local");
    }
}
