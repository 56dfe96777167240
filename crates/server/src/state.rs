//! Application state shared by every operation.

use crate::metrics::MetricsRetryObserver;
use anyhow::{Context, Result};
use cabinet_core::config::AppConfig;
use cabinet_metadata::{MetadataStore, RetryExecutor};
use cabinet_storage::{BlobStore, UploadCoordinator};
use std::sync::Arc;

/// Shared application state.
///
/// Store handles are built once at startup and passed in. There is no
/// process-wide client; tests construct their own state around whichever
/// stores they need.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Multipart lifecycle and bulk deletes against the blob store.
    pub coordinator: UploadCoordinator,
    /// Re-runs write transactions on serialization failure.
    pub retry: RetryExecutor,
}

impl AppState {
    /// Assemble state from already-open stores.
    pub fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let coordinator = UploadCoordinator::new(blobs, &config.engine);
        let retry =
            RetryExecutor::from_config(&config.engine).with_observer(Arc::new(MetricsRetryObserver));
        Self {
            config: Arc::new(config),
            metadata,
            coordinator,
            retry,
        }
    }

    /// Validate configuration, open both stores and check they respond.
    pub async fn init(config: AppConfig) -> Result<Self> {
        config
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid configuration")?;

        let blobs = cabinet_storage::from_config(&config.storage)
            .await
            .context("failed to initialize blob store")?;
        blobs
            .health_check()
            .await
            .context("blob store health check failed")?;
        tracing::info!(backend = blobs.backend_name(), "blob store initialized");

        let metadata = cabinet_metadata::from_config(&config.metadata)
            .await
            .context("failed to initialize metadata store")?;
        metadata
            .health_check()
            .await
            .context("metadata store health check failed")?;
        tracing::info!("metadata store initialized");

        Ok(Self::new(config, metadata, blobs))
    }

    /// Release store connections. Call once, after the last operation.
    pub async fn shutdown(&self) {
        self.metadata.close().await;
        tracing::info!("metadata store closed");
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        self.coordinator.store()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabinet_core::config::MetadataConfig;

    #[tokio::test]
    async fn test_init_opens_test_stores() {
        let temp = tempfile::tempdir().unwrap();
        let state = AppState::init(AppConfig::for_testing(temp.path()))
            .await
            .unwrap();
        assert_eq!(state.blobs().backend_name(), "filesystem");
        assert_eq!(state.retry.max_attempts(), 3);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_init_rejects_invalid_config() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = AppConfig::for_testing(temp.path());
        config.engine.retry_max_attempts = 0;
        assert!(AppState::init(config).await.is_err());

        let mut config = AppConfig::for_testing(temp.path());
        config.metadata = MetadataConfig::Postgres {
            url: None,
            host: None,
            port: None,
            username: None,
            password: None,
            database: None,
            ssl_mode: None,
            max_connections: 5,
            acquire_timeout_secs: 3,
            statement_timeout_ms: None,
        };
        assert!(AppState::init(config).await.is_err());
    }
}
