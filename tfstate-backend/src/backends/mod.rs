//! Backend implementations for state storage

mod http;
mod local;
pub mod object;
mod remote;

pub use local::LocalBackend;
pub use object::{
    AzureBackend, AzureBlobStore, GcsBackend, GcsStore, LockStrategy, MemoryObjectStore,
    ObjectStorageBackend, ObjectStore, S3Backend, S3Store,
};
pub use remote::RemoteBackend;

use crate::backend::{BackendError, BackendResult, StateBackend, check_select_workspace};
use crate::config::BackendConfig;

/// Backend types that are recognized but have no implementation here
pub const UNIMPLEMENTED_BACKENDS: &[&str] = &[
    "consul",
    "etcdv3",
    "http",
    "pg",
    "kubernetes",
    "cos",
    "oss",
    "swift",
    "manta",
    "artifactory",
];

/// Create a backend from configuration
///
/// Dispatches on `backend_type`. Recognized but unimplemented types, and
/// unknown ones, fail with [`BackendError::Unsupported`]; a known type with bad
/// attributes fails with [`BackendError::Configuration`].
pub async fn create_backend(config: &BackendConfig) -> BackendResult<Box<dyn StateBackend>> {
    check_select_workspace(config.workspace())?;
    let backend: Box<dyn StateBackend> = match config.backend_type.as_str() {
        "local" => Box::new(LocalBackend::from_config(config)?),
        "s3" => Box::new(S3Backend::from_config(config).await?),
        "azurerm" | "azure" => Box::new(AzureBackend::from_config(config)?),
        "gcs" => Box::new(GcsBackend::from_config(config)?),
        "remote" | "cloud" | "terraform_cloud" => {
            Box::new(RemoteBackend::from_config(config).await?)
        }
        "memory" => {
            let store = if config.get_bool_or("leases", false) {
                MemoryObjectStore::with_leases()
            } else {
                MemoryObjectStore::new()
            };
            let key = config.get_string("key").unwrap_or("terraform.tfstate");
            Box::new(ObjectStorageBackend::new(store, key, config))
        }
        other if UNIMPLEMENTED_BACKENDS.contains(&other) => {
            return Err(BackendError::unsupported_backend(
                other,
                "backend type is recognized but not implemented",
            ));
        }
        other => {
            return Err(BackendError::unsupported_backend(
                other,
                "unknown backend type",
            ));
        }
    };

    log::debug!("created {} backend", config.backend_type);
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ErrorCategory;

    #[tokio::test]
    async fn test_unsupported_backend() {
        let result = create_backend(&BackendConfig::new("unsupported")).await;
        match result {
            Err(BackendError::Unsupported { backend_type, .. }) => {
                assert_eq!(backend_type, "unsupported");
            }
            _ => panic!("Expected Unsupported error"),
        }
    }

    #[tokio::test]
    async fn test_recognized_but_unimplemented() {
        for name in UNIMPLEMENTED_BACKENDS {
            let err = create_backend(&BackendConfig::new(*name)).await.err().unwrap();
            assert_eq!(err.category(), ErrorCategory::Unsupported, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_missing_attributes_are_configuration_errors() {
        for name in ["azurerm", "azure", "gcs", "remote", "cloud"] {
            let err = create_backend(&BackendConfig::new(name)).await.err().unwrap();
            assert!(
                matches!(err, BackendError::Configuration(_)),
                "{}: {:?}",
                name,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_create_local_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let local = BackendConfig::new("local")
            .with_attribute("path", dir.path().to_string_lossy().to_string());
        let backend = create_backend(&local).await.unwrap();
        assert_eq!(backend.metadata().await.backend_type, "local");

        let memory = BackendConfig::new("memory").with_attribute("leases", true);
        let backend = create_backend(&memory).await.unwrap();
        assert_eq!(backend.metadata().await.backend_type, "memory");
        assert_eq!(backend.pull().await.unwrap().serial, 0);
    }
}
