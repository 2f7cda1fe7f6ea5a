//! Terraform State Backends
//!
//! This crate stores Terraform-compatible state (`terraform.tfstate` JSON)
//! in interchangeable backends, all behind one [`StateBackend`] contract:
//! pull, push, lock, history and workspaces.
//!
//! # Overview
//!
//! - **StateData**: a state document plus the header fields every backend reads
//! - **StateBackend**: the async trait implemented by each backend
//! - **LockInfo**: who holds a lock, for what, since when
//! - **Backends**: local files, S3, Azure blob storage, Google Cloud Storage,
//!   the remote state service, and an in-memory store
//! - **ResilientBackend**: rate limiting, a bulkhead, and retries behind a
//!   circuit breaker, wrapped around any backend
//! - **StateAdapter**: flat-key access (`env/production`) to a backend
//!
//! # Example
//!
//! ```no_run
//! use tfstate_backend::{BackendConfig, LockInfo, StateBackend, create_backend};
//!
//! # async fn run() -> tfstate_backend::BackendResult<()> {
//! let config = BackendConfig::new("s3")
//!     .with_attribute("bucket", "my-state-bucket")
//!     .with_attribute("key", "infra/prod/terraform.tfstate")
//!     .with_attribute("region", "ap-northeast-1");
//!
//! let backend = create_backend(&config).await?;
//!
//! // Acquire lock before modifying state
//! let lock_id = backend.lock(&LockInfo::new("apply")).await?;
//!
//! let mut state = backend.pull().await?;
//! state.increment_serial();
//! backend.push(&state).await?;
//!
//! backend.unlock(&lock_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod backend;
pub mod backends;
pub mod config;
pub mod lock;
pub mod pool;
pub mod resilience;
pub mod state;

// Re-export main types for convenience
pub use adapter::{StateAdapter, StateVersionInfo, workspace_from_key};
pub use backend::{
    BackendError, BackendMetadata, BackendResult, DEFAULT_WORKSPACE, ErrorCategory, StateBackend,
};
pub use backends::{
    LocalBackend, MemoryObjectStore, ObjectStorageBackend, RemoteBackend, create_backend,
};
pub use config::{BackendConfig, LockConfig, PoolConfig, RetryConfig};
pub use lock::LockInfo;
pub use resilience::{ResilienceConfig, ResilientBackend};
pub use state::{StateData, StateResource, StateVersion};
