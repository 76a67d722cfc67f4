//! ClickHouse Backup Library
//!
//! Incremental, deduplicating backup and restore of ClickHouse data parts to
//! S3-compatible object storage.

pub mod backup;
pub mod clickhouse;
pub mod config;
pub mod dedup;
pub mod metadata;
pub mod pool;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use backup::{BackupOptions, ClickhouseBackup, RestoreOptions};
pub use config::Config;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
