//! State backend trait and error types

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::LockInfo;
use crate::state::{StateData, StateVersion};

/// Name of the workspace every backend starts in
pub const DEFAULT_WORKSPACE: &str = "default";

/// Errors that can occur when interacting with a state backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The state is locked by another process
    #[error("state is already locked by {who} since {created} (lock ID: {lock_id}, operation: {operation})")]
    Locked {
        lock_id: String,
        who: String,
        operation: String,
        created: String,
    },

    /// No lock is held where one was expected
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// Lock ID mismatch when trying to release
    #[error("Lock ID mismatch: expected {expected}, got {actual}")]
    LockMismatch { expected: String, actual: String },

    #[error("workspace {0} does not exist")]
    WorkspaceNotFound(String),

    #[error("workspace {0} already exists")]
    WorkspaceExists(String),

    /// The default workspace is implicit and permanent
    #[error("cannot {0} default workspace")]
    DefaultWorkspace(&'static str),

    #[error("cannot delete current workspace {0}")]
    CurrentWorkspace(String),

    #[error("state version {0} not found")]
    VersionNotFound(String),

    /// A push would move the serial backwards (or sideways) within a lineage
    #[error("state serial must increase within lineage {lineage}: stored {current}, attempted {attempted}")]
    SerialRegression {
        lineage: String,
        current: u64,
        attempted: u64,
    },

    /// State lineage mismatch (prevents accidental state overwrites)
    #[error("State lineage mismatch: expected {expected}, got {actual}")]
    LineageMismatch { expected: String, actual: String },

    /// The backend type is recognized but not available, or not recognized at all
    #[error("Unsupported backend type {backend_type}: {reason}")]
    Unsupported {
        backend_type: String,
        reason: String,
    },

    /// Configuration error
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// State file is corrupted or invalid
    #[error("Invalid state file: {0}")]
    InvalidState(String),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Error reported by a storage substrate client
    #[error("{backend} error: {message}")]
    Storage { backend: String, message: String },

    /// Non-success HTTP response
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// No pooled connection became available in time
    #[error("deadline exceeded waiting {0:?} for a pooled connection")]
    PoolTimeout(Duration),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("circuit breaker is open: {0}")]
    CircuitOpen(String),

    #[error("capacity exceeded: {limit} calls already in flight")]
    CapacityExceeded { limit: usize },

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification of a [`BackendError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    Conflict,
    Validation,
    /// Network, timeout, throttling; the only category worth retrying
    Transient,
    Unsupported,
    /// Refused locally by the resilience layer (open circuit, full bulkhead, rate limit)
    Rejected,
}

/// Message fragments that mark an otherwise opaque substrate error as transient
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "throttl",
    "slow down",
    "slowdown",
    "too many requests",
    "service unavailable",
    "temporarily",
    "503",
    "500 internal",
    "dispatch failure",
    "broken pipe",
];

impl BackendError {
    /// Create a Locked error from a LockInfo
    pub fn locked(lock: &LockInfo) -> Self {
        Self::Locked {
            lock_id: lock.id.clone(),
            who: lock.who.clone(),
            operation: lock.operation.clone(),
            created: format_time(&lock.created),
        }
    }

    /// Create an unsupported backend error
    pub fn unsupported_backend(backend_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            backend_type: backend_type.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a substrate error tagged with the backend name
    pub fn storage(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Map an HTTP status and body to the matching error variant
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 => Self::Timeout(message),
            429 => Self::Throttled(message),
            502..=504 => Self::Unavailable(message),
            _ => Self::Http { status, message },
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::LockNotFound(_) | Self::WorkspaceNotFound(_) | Self::VersionNotFound(_) => {
                ErrorCategory::NotFound
            }
            Self::Locked { .. }
            | Self::LockMismatch { .. }
            | Self::WorkspaceExists(_)
            | Self::DefaultWorkspace(_)
            | Self::CurrentWorkspace(_)
            | Self::SerialRegression { .. }
            | Self::LineageMismatch { .. } => ErrorCategory::Conflict,
            Self::Configuration(_) | Self::InvalidState(_) | Self::Serialization(_) => {
                ErrorCategory::Validation
            }
            Self::Unsupported { .. } => ErrorCategory::Unsupported,
            Self::Timeout(_) | Self::Throttled(_) | Self::Unavailable(_) | Self::PoolTimeout(_) => {
                ErrorCategory::Transient
            }
            Self::CircuitOpen(_)
            | Self::CapacityExceeded { .. }
            | Self::RateLimited { .. }
            | Self::PoolClosed => ErrorCategory::Rejected,
            Self::Http { status, .. } => match status {
                404 => ErrorCategory::NotFound,
                409 | 412 | 423 => ErrorCategory::Conflict,
                400 | 401 | 403 | 422 => ErrorCategory::Validation,
                _ if *status >= 500 => ErrorCategory::Transient,
                _ => ErrorCategory::Validation,
            },
            Self::Io(message) | Self::Storage { message, .. } => {
                if matches_transient_pattern(message) {
                    ErrorCategory::Transient
                } else {
                    ErrorCategory::Validation
                }
            }
        }
    }

    /// Whether retrying the same call could succeed
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

fn matches_transient_pattern(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Static capability descriptor of a backend instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMetadata {
    #[serde(rename = "type")]
    pub backend_type: String,
    pub supports_locking: bool,
    pub supports_versions: bool,
    pub supports_workspaces: bool,
    /// Non-secret configuration echoed back for display
    pub configuration: BTreeMap<String, String>,
    /// Currently selected workspace
    pub workspace: String,
    pub state_key: String,
}

/// Trait for state storage backends
///
/// Every implementation presents the same consistency contract regardless of
/// the substrate:
///
/// - `pull` on a workspace without state returns [`StateData::empty`], not an error
/// - `push` is atomic: readers see either the previous or the new bytes
/// - `lock` is exclusive per (backend, workspace) and fails fast with
///   [`BackendError::Locked`] naming the holder when known
/// - the default workspace can't be created or deleted, the selected one
///   can't be deleted, and selecting a missing workspace changes nothing
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Read the latest state of the active workspace
    async fn pull(&self) -> BackendResult<StateData>;

    /// Write the state as the new latest version of the active workspace
    ///
    /// The state's serial number should be incremented before calling this
    async fn push(&self, state: &StateData) -> BackendResult<()>;

    /// Acquire an exclusive lock, returning the lock ID to pass to `unlock`
    async fn lock(&self, info: &LockInfo) -> BackendResult<String>;

    /// Release a previously acquired lock
    async fn unlock(&self, lock_id: &str) -> BackendResult<()>;

    /// List the stored history of the active workspace, newest first
    async fn get_versions(&self) -> BackendResult<Vec<StateVersion>>;

    /// Fetch one history entry; `"current"` or `""` means the latest
    async fn get_version(&self, version_id: &str) -> BackendResult<StateData>;

    async fn list_workspaces(&self) -> BackendResult<Vec<String>>;

    async fn select_workspace(&self, name: &str) -> BackendResult<()>;

    async fn create_workspace(&self, name: &str) -> BackendResult<()>;

    async fn delete_workspace(&self, name: &str) -> BackendResult<()>;

    /// Current lock holder, or [`BackendError::LockNotFound`] when unlocked
    async fn get_lock_info(&self) -> BackendResult<LockInfo>;

    /// Check that the backend is configured correctly and reachable
    async fn validate(&self) -> BackendResult<()>;

    async fn metadata(&self) -> BackendMetadata;
}

#[async_trait]
impl<T: StateBackend + ?Sized> StateBackend for Box<T> {
    async fn pull(&self) -> BackendResult<StateData> {
        (**self).pull().await
    }

    async fn push(&self, state: &StateData) -> BackendResult<()> {
        (**self).push(state).await
    }

    async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        (**self).lock(info).await
    }

    async fn unlock(&self, lock_id: &str) -> BackendResult<()> {
        (**self).unlock(lock_id).await
    }

    async fn get_versions(&self) -> BackendResult<Vec<StateVersion>> {
        (**self).get_versions().await
    }

    async fn get_version(&self, version_id: &str) -> BackendResult<StateData> {
        (**self).get_version(version_id).await
    }

    async fn list_workspaces(&self) -> BackendResult<Vec<String>> {
        (**self).list_workspaces().await
    }

    async fn select_workspace(&self, name: &str) -> BackendResult<()> {
        (**self).select_workspace(name).await
    }

    async fn create_workspace(&self, name: &str) -> BackendResult<()> {
        (**self).create_workspace(name).await
    }

    async fn delete_workspace(&self, name: &str) -> BackendResult<()> {
        (**self).delete_workspace(name).await
    }

    async fn get_lock_info(&self) -> BackendResult<LockInfo> {
        (**self).get_lock_info().await
    }

    async fn validate(&self) -> BackendResult<()> {
        (**self).validate().await
    }

    async fn metadata(&self) -> BackendMetadata {
        (**self).metadata().await
    }
}

/// Shared workspace-name checks applied before any substrate call
pub(crate) fn check_create_workspace(name: &str) -> BackendResult<()> {
    if name == DEFAULT_WORKSPACE {
        return Err(BackendError::DefaultWorkspace("create"));
    }
    validate_workspace_name(name)
}

pub(crate) fn check_select_workspace(name: &str) -> BackendResult<()> {
    if name == DEFAULT_WORKSPACE {
        return Ok(());
    }
    validate_workspace_name(name)
}

pub(crate) fn check_delete_workspace(name: &str, current: &str) -> BackendResult<()> {
    if name == DEFAULT_WORKSPACE {
        return Err(BackendError::DefaultWorkspace("delete"));
    }
    validate_workspace_name(name)?;
    if name == current {
        return Err(BackendError::CurrentWorkspace(name.to_string()));
    }
    Ok(())
}

/// Names must stay a single path segment on every substrate
pub(crate) fn validate_workspace_name(name: &str) -> BackendResult<()> {
    if name.is_empty() {
        return Err(BackendError::configuration("workspace name cannot be empty"));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(BackendError::configuration(format!(
            "invalid workspace name: {}",
            name
        )));
    }
    Ok(())
}

/// Format a timestamp the way lock conflicts report it
pub(crate) fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339()
}
