//! Remote storage: one transfer contract, one implementation per backend.
//!
//! The orchestrator only ever sees [`StorageEngine`] (through [`layout::BackupLayout`]),
//! so backends are chosen once at startup by [`create_engine`].

pub mod layout;
pub mod object;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;

use crate::config::{StorageConfig, StorageType};
use crate::utils::errors::Result;

pub use layout::BackupLayout;
pub use object::ObjectStorageEngine;

/// Outcome of one member of a bulk delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub path: String,
    /// `None` when the object is gone (deleted now or already absent)
    pub error: Option<String>,
}

impl DeleteOutcome {
    pub fn is_deleted(&self) -> bool {
        self.error.is_none()
    }
}

/// Uniform chunked transfer contract over a remote store.
///
/// Every call is retried with bounded backoff on transient errors; permanent
/// errors propagate immediately. Multipart sessions are single-writer: parts of
/// one upload session must be submitted sequentially.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Store `data` at `remote_path`, returning the normalized remote path
    async fn upload_data(&self, data: Bytes, remote_path: &str) -> Result<String>;

    /// Store a local file, switching to a multipart upload above one chunk
    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<String>;

    async fn download_data(&self, remote_path: &str) -> Result<Bytes>;

    /// Stream an object into a local file, returning the number of bytes written
    async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<u64>;

    async fn delete_file(&self, remote_path: &str) -> Result<()>;

    /// Delete many objects in backend-sized batches, reporting every member
    async fn delete_files(&self, remote_paths: &[String]) -> Result<Vec<DeleteOutcome>>;

    async fn path_exists(&self, remote_path: &str) -> Result<bool>;

    /// Entries below `remote_path`, relative to it. Non-recursive listings
    /// include immediate sub-directories.
    async fn list_dir(&self, remote_path: &str, recursive: bool) -> Result<Vec<String>>;

    async fn create_multipart_upload(&self, remote_path: &str) -> Result<String>;

    /// Append the next part (numbered from 1 in submission order)
    async fn upload_part(&self, upload_id: &str, data: Bytes) -> Result<()>;

    /// Assemble the recorded parts; the session id is invalid afterwards
    async fn complete_multipart_upload(&self, upload_id: &str) -> Result<()>;

    async fn abort_multipart_upload(&self, upload_id: &str) -> Result<()>;

    async fn create_multipart_download(&self, remote_path: &str) -> Result<String>;

    /// Read the next part of a download session.
    ///
    /// `None` reads up to the configured chunk size, `Some(n)` up to `n` bytes
    /// (`Some(0)` is rejected). Returns `Ok(None)` once the object is exhausted.
    async fn download_part(&self, download_id: &str, part_len: Option<usize>)
        -> Result<Option<Bytes>>;

    async fn complete_multipart_download(&self, download_id: &str) -> Result<()>;
}

/// Build the storage engine selected by configuration
pub fn create_engine(config: &StorageConfig) -> Result<Arc<dyn StorageEngine>> {
    let engine = match config.storage_type {
        StorageType::S3 => ObjectStorageEngine::s3(config)?,
        StorageType::Memory => ObjectStorageEngine::in_memory(config),
    };
    Ok(Arc::new(engine))
}
