//! Configuration management for ch-backup.
//!
//! Loads configuration from a TOML/YAML/JSON file with environment variable
//! overrides (`CH_BACKUP__<SECTION>__<KEY>`). Every field has a default, so a
//! partial file is enough.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::utils::errors::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub clickhouse: ClickhouseConfig,
    pub backup: BackupConfig,
    pub storage: StorageConfig,
    pub multiprocessing: MultiprocessingConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickhouseConfig {
    /// ClickHouse data directory (contains `data/`, `metadata/`, `shadow/`)
    pub data_path: PathBuf,

    /// Directory holding local access entity files
    pub access_control_path: PathBuf,

    /// HTTP interface host
    pub host: String,

    /// `http` or `https`
    pub protocol: String,

    /// HTTP interface port
    pub port: u16,

    /// HTTP interface credentials
    pub user: Option<String>,
    pub password: Option<String>,

    /// Query timeout in seconds
    pub timeout_secs: u64,

    /// Owner applied to restored part files
    pub owner_user: String,
    pub owner_group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Storage prefix under which every backup directory lives
    pub path_root: String,

    /// Databases skipped when no explicit list is requested
    pub exclude_dbs: Vec<String>,

    /// Link unchanged parts to previous backups instead of uploading them again
    pub deduplicate_parts: bool,

    /// Only backups finished within this many days are deduplication sources
    pub deduplication_age_limit_days: i64,

    /// A new backup is skipped if the latest one finished less than this many minutes ago
    pub min_interval_minutes: i64,

    /// Purge keeps backups finished within this many days
    pub retain_time_days: Option<i64>,

    /// Purge keeps this many newest backups
    pub retain_count: Option<usize>,

    /// User labels stored in backup metadata
    pub labels: BTreeMap<String, String>,

    /// Leave shadow data in place when a backup fails
    pub keep_freezed_data_on_failure: bool,

    /// Back up local access entities
    pub backup_access_control: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    S3,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: StorageType,

    pub endpoint_url: Option<String>,
    pub bucket: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: String,

    /// Use `bucket.host` addressing instead of `host/bucket`
    pub virtual_hosted_style: bool,

    /// Chunk size used when uploading / downloading data, in bytes
    pub chunk_size: usize,

    /// Upper bound on the number of parts of one multipart upload.
    /// The chunk size grows as needed to respect it.
    pub max_chunk_count: usize,

    /// How many objects one bulk delete request may carry
    pub bulk_delete_chunk_size: usize,

    /// Pack each data part into a single tar object
    pub tarball_parts: bool,

    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiprocessingConfig {
    /// Number of transfer workers
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for ClickhouseConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("/var/lib/clickhouse"),
            access_control_path: PathBuf::from("/var/lib/clickhouse/access"),
            host: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string()),
            protocol: "http".to_string(),
            port: 8123,
            user: None,
            password: None,
            timeout_secs: 90,
            owner_user: "clickhouse".to_string(),
            owner_group: "clickhouse".to_string(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            path_root: "ch_backup".to_string(),
            exclude_dbs: vec!["system".to_string(), "default".to_string()],
            deduplicate_parts: true,
            deduplication_age_limit_days: 7,
            min_interval_minutes: 0,
            retain_time_days: None,
            retain_count: None,
            labels: BTreeMap::new(),
            keep_freezed_data_on_failure: true,
            backup_access_control: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::S3,
            endpoint_url: None,
            bucket: None,
            access_key_id: None,
            secret_access_key: None,
            region: "us-east-1".to_string(),
            virtual_hosted_style: false,
            chunk_size: 8 * 1024 * 1024,
            max_chunk_count: 10_000,
            bulk_delete_chunk_size: 1000,
            tarball_parts: true,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval_ms: 500,
            max_interval_ms: 5000,
        }
    }
}

impl Default for MultiprocessingConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file, applying environment overrides on top
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("CH_BACKUP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Render the effective configuration
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::BackupError::Config(format!("Failed to render config: {}", e)))
    }
}
