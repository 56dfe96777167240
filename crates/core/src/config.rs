//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration: retry bound, per-call timeouts and URL lifetimes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts per serializable write before giving up.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// Bound on each relational-store call, in milliseconds.
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,
    /// Bound on small blob-store calls (start, abort, delete), in milliseconds.
    /// Multipart completion is not bounded by this value.
    #[serde(default = "default_blob_timeout_ms")]
    pub blob_timeout_ms: u64,
    /// Lifetime of signed part-upload URLs, in seconds.
    #[serde(default = "default_part_url_expiry_secs")]
    pub part_url_expiry_secs: u64,
    /// Lifetime of signed download URLs, in seconds.
    #[serde(default = "default_download_url_expiry_secs")]
    pub download_url_expiry_secs: u64,
    /// Quota assigned to newly provisioned users, in bytes.
    #[serde(default = "default_space_quota")]
    pub default_space_quota: i64,
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_metadata_timeout_ms() -> u64 {
    5_000
}

fn default_blob_timeout_ms() -> u64 {
    5_000
}

fn default_part_url_expiry_secs() -> u64 {
    3 * 24 * 60 * 60 // 3 days
}

fn default_download_url_expiry_secs() -> u64 {
    60
}

fn default_space_quota() -> i64 {
    10_000_000_000 // 10 GB
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: default_retry_max_attempts(),
            metadata_timeout_ms: default_metadata_timeout_ms(),
            blob_timeout_ms: default_blob_timeout_ms(),
            part_url_expiry_secs: default_part_url_expiry_secs(),
            download_url_expiry_secs: default_download_url_expiry_secs(),
            default_space_quota: default_space_quota(),
        }
    }
}

impl EngineConfig {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn blob_timeout(&self) -> Duration {
        Duration::from_millis(self.blob_timeout_ms)
    }

    pub fn part_url_expiry(&self) -> Duration {
        Duration::from_secs(self.part_url_expiry_secs)
    }

    pub fn download_url_expiry(&self) -> Duration {
        Duration::from_secs(self.download_url_expiry_secs)
    }

    /// Validate engine configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.retry_max_attempts == 0 {
            return Err("engine.retry_max_attempts must be at least 1".to_string());
        }
        if self.metadata_timeout_ms == 0 || self.blob_timeout_ms == 0 {
            return Err("engine timeouts must be greater than zero".to_string());
        }
        // S3 rejects presigned URLs valid for longer than seven days.
        if self.part_url_expiry_secs == 0 || self.part_url_expiry_secs > 7 * 24 * 60 * 60 {
            return Err("engine.part_url_expiry_secs must be between 1 and 604800".to_string());
        }
        if self.download_url_expiry_secs == 0 {
            return Err("engine.download_url_expiry_secs must be greater than zero".to_string());
        }
        if self.default_space_quota < 0 {
            return Err("engine.default_space_quota must not be negative".to_string());
        }
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to AWS_ACCESS_KEY_ID env var if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to AWS_SECRET_ACCESS_KEY env var if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        secret_access_key: Option<String>,
        /// Force path-style URLs (e.g., `endpoint/bucket/key` instead of `bucket.endpoint/key`).
        /// Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/blobs"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 config requires a bucket name".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (testing and single-node deployments).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// How long to wait for the pooled connection, in seconds.
        #[serde(default = "default_acquire_timeout_secs")]
        acquire_timeout_secs: u64,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL (optional if using individual fields).
        /// Takes precedence over individual fields if both are provided.
        url: Option<String>,
        /// Database host.
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password.
        /// WARNING: Prefer CABINET_METADATA__PASSWORD env var over storing in config.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// How long to wait for a pooled connection, in seconds.
        #[serde(default = "default_acquire_timeout_secs")]
        acquire_timeout_secs: u64,
        /// Statement timeout in milliseconds. PostgreSQL cancels statements
        /// that run longer.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_acquire_timeout_secs() -> u64 {
    3
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(5_000)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err("postgres config requires max_connections >= 1".to_string());
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
        }
    }
}

/// Reconciliation sweep configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Run the sweep periodically.
    #[serde(default = "default_sweep_enabled")]
    pub enabled: bool,
    /// Seconds between sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// In-progress uploads older than this are aborted and removed.
    #[serde(default = "default_stale_upload_after_secs")]
    pub stale_upload_after_secs: u64,
    /// Blob objects and multipart uploads with no matching record are only
    /// removed once older than this.
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,
    /// Maximum stale records handled per sweep.
    #[serde(default = "default_sweep_batch_size")]
    pub batch_size: u32,
    /// Log what would be removed without removing anything.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_sweep_enabled() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    60 * 60 // 1 hour
}

fn default_stale_upload_after_secs() -> u64 {
    7 * 24 * 60 * 60 // 7 days
}

fn default_orphan_grace_secs() -> u64 {
    24 * 60 * 60 // 1 day
}

fn default_sweep_batch_size() -> u32 {
    500
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweep_enabled(),
            interval_secs: default_sweep_interval_secs(),
            stale_upload_after_secs: default_stale_upload_after_secs(),
            orphan_grace_secs: default_orphan_grace_secs(),
            batch_size: default_sweep_batch_size(),
            dry_run: false,
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Validate sweep configuration invariants.
    pub fn validate(&self, engine: &EngineConfig) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("sweep.interval_secs must be greater than zero".to_string());
        }
        if self.batch_size == 0 {
            return Err("sweep.batch_size must be greater than zero".to_string());
        }
        // A stale threshold shorter than the part URL lifetime would abort
        // uploads that clients can still legitimately finish.
        if self.stale_upload_after_secs < engine.part_url_expiry_secs {
            return Err(format!(
                "sweep.stale_upload_after_secs ({}) must be at least engine.part_url_expiry_secs ({})",
                self.stale_upload_after_secs, engine.part_url_expiry_secs
            ));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Reconciliation sweep configuration.
    #[serde(default)]
    pub sweep: SweepConfig,
    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// Create a test configuration rooted in `dir`.
    ///
    /// **For testing only.** Uses filesystem storage and SQLite metadata.
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            engine: EngineConfig::default(),
            storage: StorageConfig::Filesystem {
                path: dir.join("blobs"),
            },
            metadata: MetadataConfig::Sqlite {
                path: dir.join("metadata.db"),
                acquire_timeout_secs: default_acquire_timeout_secs(),
            },
            sweep: SweepConfig {
                enabled: false,
                ..SweepConfig::default()
            },
            log: LogConfig::default(),
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.engine.validate()?;
        self.storage.validate()?;
        self.metadata.validate()?;
        self.sweep.validate(&self.engine)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.metadata_timeout(), Duration::from_secs(5));
        assert_eq!(config.download_url_expiry(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_deserialize_partial() {
        let json = r#"{"retry_max_attempts": 5}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(config.blob_timeout_ms, 5_000);
    }

    #[test]
    fn test_engine_rejects_week_long_part_urls() {
        let config = EngineConfig {
            part_url_expiry_secs: 8 * 24 * 60 * 60,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sweep_threshold_must_outlive_part_urls() {
        let engine = EngineConfig::default();
        let sweep = SweepConfig {
            stale_upload_after_secs: 60,
            ..SweepConfig::default()
        };
        assert!(sweep.validate(&engine).is_err());
        assert!(SweepConfig::default().validate(&engine).is_ok());
    }

    #[test]
    fn test_storage_config_s3_roundtrip_without_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: Some("http://localhost:9000".to_string()),
            region: Some("us-east-1".to_string()),
            prefix: Some("files".to_string()),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: true,
        };

        let json = serde_json::to_string(&config).unwrap();
        let decoded: StorageConfig = serde_json::from_str(&json).unwrap();
        assert!(decoded.validate().is_ok());
        match decoded {
            StorageConfig::S3 {
                access_key_id,
                force_path_style,
                ..
            } => {
                assert!(access_key_id.is_none());
                assert!(force_path_style);
            }
            _ => panic!("expected S3 config"),
        }
    }

    #[test]
    fn test_s3_requires_paired_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("id".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_postgres_config_requires_target() {
        let json = r#"{"type": "postgres", "host": "db"}"#;
        let config: MetadataConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());

        let json = r#"{"type": "postgres", "url": "postgres://localhost/cabinet"}"#;
        let config: MetadataConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testing_config_is_valid() {
        let config = AppConfig::for_testing(std::path::Path::new("/tmp/cabinet"));
        assert!(config.validate().is_ok());
        assert!(!config.sweep.enabled);
    }
}
