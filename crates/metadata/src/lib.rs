//! Metadata store abstraction and implementations for Cabinet.
//!
//! This crate owns the consistency-critical state:
//! - Users, space quotas, and repositories
//! - Memberships and repository access
//! - Resources (files and folders) keyed by repository path
//! - Acknowledged upload parts
//!
//! Every write method runs exactly one serializable transaction and may fail
//! with a serialization conflict. [`RetryExecutor`] re-runs such units of
//! work. Pure decision logic lives in [`gate`] and [`hierarchy`].

pub mod error;
pub mod gate;
pub mod hierarchy;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod retry;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use gate::{Access, Admission};
pub use hierarchy::{DeleteSet, PathRewrite};
pub use postgres::{PoolSettings, PostgresStore};
pub use retry::{RetryExecutor, RetryObserver};
pub use store::{MetadataStore, SqliteStore};

use cabinet_core::config::MetadataConfig;
use std::sync::Arc;
use std::time::Duration;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            acquire_timeout_secs,
        } => {
            let store = SqliteStore::new(path, Duration::from_secs(*acquire_timeout_secs)).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            ssl_mode,
            max_connections,
            acquire_timeout_secs,
            statement_timeout_ms,
        } => {
            let settings = PoolSettings {
                max_connections: *max_connections,
                acquire_timeout: Duration::from_secs(*acquire_timeout_secs),
                statement_timeout_ms: *statement_timeout_ms,
            };
            let store = if let Some(url) = url {
                // URL takes precedence over individual fields
                tracing::info!("Connecting to PostgreSQL using connection URL");
                PostgresStore::from_url(url, settings).await?
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                PostgresStore::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *ssl_mode,
                    settings,
                )
                .await?
            } else {
                return Err(MetadataError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            };
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("metadata.db");

        let config = MetadataConfig::Sqlite {
            path: db_path.clone(),
            acquire_timeout_secs: 3,
        };

        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_from_config_postgres_requires_target() {
        let config = MetadataConfig::Postgres {
            url: None,
            host: None,
            port: Some(5432),
            username: None,
            password: None,
            database: None,
            ssl_mode: None,
            max_connections: 1,
            acquire_timeout_secs: 1,
            statement_timeout_ms: None,
        };

        match from_config(&config).await {
            Err(MetadataError::Config(msg)) => assert!(msg.contains("host")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected config error"),
        }
    }
}
