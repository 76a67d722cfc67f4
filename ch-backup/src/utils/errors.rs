//! Error types for backup and restore runs.

use std::io::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ClickHouse query failed ({status}): {message}")]
    Query { status: u16, message: String },

    #[error("Unable to freeze table {database}.{table}: {reason}")]
    Freeze {
        database: String,
        table: String,
        reason: String,
    },

    #[error("Schema error for {entity}: {reason}")]
    Schema { entity: String, reason: String },

    #[error("Required databases were not found in backup {backup}: {}", .missing.join(", "))]
    MissingDatabases {
        backup: String,
        missing: Vec<String>,
    },

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Backup {0} is incomplete and cannot be used")]
    BackupIncomplete(String),

    #[error("Can not load backup meta file {path}: {source}")]
    MetadataDecode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),

    #[error("Job {id} failed: {source}")]
    JobFailed {
        id: String,
        #[source]
        source: Box<BackupError>,
    },

    #[error("Job {0} panicked")]
    JobPanicked(String),

    #[error("Timed out waiting for {0} outstanding jobs")]
    PoolTimeout(usize),

    #[error("Execution pool is shut down")]
    PoolClosed,

    #[error("Unknown transfer session: {0}")]
    UnknownSession(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl BackupError {
    /// Whether a retry of the failed call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackupError::Storage(e) => matches!(
                e,
                object_store::Error::Generic { .. } | object_store::Error::JoinError { .. }
            ),
            BackupError::Http(e) => e.is_timeout() || e.is_connect(),
            BackupError::Io(e) => matches!(
                e.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::Interrupted
                    | ErrorKind::BrokenPipe
            ),
            BackupError::Query { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the error reports a missing object or file.
    pub fn is_not_found(&self) -> bool {
        match self {
            BackupError::Storage(object_store::Error::NotFound { .. }) => true,
            BackupError::Io(e) => e.kind() == ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<config::ConfigError> for BackupError {
    fn from(e: config::ConfigError) -> Self {
        BackupError::Config(e.to_string())
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(e: tokio::task::JoinError) -> Self {
        BackupError::Io(std::io::Error::new(ErrorKind::Other, e))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
