//! Storage engine for S3-compatible object stores, built on `object_store`.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path as ObjectPath;
use object_store::{MultipartId, ObjectStore, PutPayload};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{DeleteOutcome, StorageEngine};
use crate::config::{RetryConfig, StorageConfig};
use crate::utils::errors::{BackupError, Result};
use crate::utils::retry::{backoff_delay, retry};

struct UploadSession {
    path: ObjectPath,
    /// (part number, integrity tag) in submission order
    parts: Vec<(usize, PartId)>,
}

struct DownloadSession {
    path: ObjectPath,
    size: usize,
    offset: usize,
}

pub struct ObjectStorageEngine {
    store: Arc<dyn ObjectStore>,
    multipart: Arc<dyn MultipartStore>,
    retry: RetryConfig,
    chunk_size: usize,
    max_chunk_count: usize,
    bulk_delete_chunk_size: usize,
    uploads: Mutex<HashMap<MultipartId, UploadSession>>,
    downloads: Mutex<HashMap<String, DownloadSession>>,
}

impl ObjectStorageEngine {
    pub fn new<S>(store: Arc<S>, config: &StorageConfig) -> Self
    where
        S: ObjectStore + MultipartStore,
    {
        Self {
            store: store.clone(),
            multipart: store,
            retry: config.retry.clone(),
            chunk_size: config.chunk_size.max(1),
            max_chunk_count: config.max_chunk_count,
            bulk_delete_chunk_size: config.bulk_delete_chunk_size.max(1),
            uploads: Mutex::new(HashMap::new()),
            downloads: Mutex::new(HashMap::new()),
        }
    }

    /// S3-compatible bucket described by the storage config
    pub fn s3(config: &StorageConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .as_deref()
            .ok_or_else(|| BackupError::Config("storage.bucket is required for s3".into()))?;

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(&config.region)
            .with_virtual_hosted_style_request(config.virtual_hosted_style)
            .with_retry(client_retry_config());

        if let Some(endpoint) = &config.endpoint_url {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let Some(key_id) = &config.access_key_id {
            builder = builder.with_access_key_id(key_id);
        }
        if let Some(secret) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }

        Ok(Self::new(Arc::new(builder.build()?), config))
    }

    /// Process-local store, used for dry runs and tests
    pub fn in_memory(config: &StorageConfig) -> Self {
        Self::new(Arc::new(InMemory::new()), config)
    }

    /// Chunk size for an object of `size` bytes, grown so the part count stays
    /// within `max_chunk_count`.
    fn chunk_size_for(&self, size: usize) -> usize {
        if self.max_chunk_count == 0 {
            return self.chunk_size;
        }
        let limit = self.chunk_size.saturating_mul(self.max_chunk_count);
        if size <= limit {
            self.chunk_size
        } else {
            self.chunk_size * size.div_ceil(limit)
        }
    }

    async fn upload_chunks(&self, local_path: &Path, upload_id: &str, chunk_size: usize) -> Result<()> {
        let mut file = tokio::fs::File::open(local_path).await?;
        loop {
            let mut buf = vec![0u8; chunk_size];
            let mut filled = 0;
            while filled < chunk_size {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                return Ok(());
            }
            buf.truncate(filled);
            self.upload_part(upload_id, Bytes::from(buf)).await?;
            if filled < chunk_size {
                return Ok(());
            }
        }
    }

    async fn write_download(&self, download_id: &str, local_path: &Path) -> Result<u64> {
        let mut file = tokio::fs::File::create(local_path).await?;
        let mut written = 0u64;
        while let Some(chunk) = self.download_part(download_id, None).await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Delete one batch, retrying only the members that failed transiently.
    async fn delete_batch(&self, batch: &[String]) -> Vec<DeleteOutcome> {
        let mut outcomes: Vec<Option<DeleteOutcome>> = vec![None; batch.len()];
        let mut pending: Vec<(usize, ObjectPath)> = Vec::with_capacity(batch.len());

        for (idx, remote_path) in batch.iter().enumerate() {
            match to_object_path(remote_path) {
                Ok(path) => pending.push((idx, path)),
                Err(e) => {
                    outcomes[idx] = Some(DeleteOutcome {
                        path: remote_path.clone(),
                        error: Some(e.to_string()),
                    })
                }
            }
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        while !pending.is_empty() {
            let locations = pending.iter().map(|(_, p)| Ok::<_, object_store::Error>(p.clone())).collect::<Vec<_>>();
            let results: Vec<object_store::Result<ObjectPath>> = self
                .store
                .delete_stream(stream::iter(locations).boxed())
                .collect()
                .await;

            // A failed request reports one error for all of its keys, so members
            // are settled by the paths that come back, never by position.
            let mut confirmed: HashSet<String> = HashSet::new();
            let mut request_error: Option<(String, bool)> = None;
            for result in results {
                match result {
                    Ok(path) => {
                        confirmed.insert(path.to_string());
                    }
                    Err(object_store::Error::NotFound { path, .. }) => {
                        confirmed.insert(path);
                    }
                    Err(e) => {
                        let transient = matches!(e, object_store::Error::Generic { .. });
                        request_error.get_or_insert((e.to_string(), transient));
                    }
                }
            }

            let retryable = request_error.as_ref().map_or(true, |(_, transient)| *transient)
                && attempt < max_attempts;
            let mut retry_later = Vec::new();
            for (idx, path) in pending {
                let error = if confirmed.contains(&path.to_string()) {
                    None
                } else if retryable {
                    retry_later.push((idx, path));
                    continue;
                } else {
                    Some(
                        request_error
                            .as_ref()
                            .map(|(message, _)| message.clone())
                            .unwrap_or_else(|| "no result returned by bulk delete".to_string()),
                    )
                };
                outcomes[idx] = Some(DeleteOutcome {
                    path: batch[idx].clone(),
                    error,
                });
            }

            pending = retry_later;
            if !pending.is_empty() {
                let delay = backoff_delay(&self.retry, attempt);
                debug!(attempt, remaining = pending.len(), "Retrying bulk delete members");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }

        outcomes
            .into_iter()
            .zip(batch)
            .map(|(outcome, path)| {
                outcome.unwrap_or_else(|| DeleteOutcome {
                    path: path.clone(),
                    error: Some("not processed".to_string()),
                })
            })
            .collect()
    }
}

/// Calls are retried by [`retry`] under `storage.retry`; the client must not
/// retry them again underneath.
fn client_retry_config() -> object_store::RetryConfig {
    object_store::RetryConfig {
        max_retries: 0,
        ..Default::default()
    }
}

/// Storage paths are relative; a leading slash is ignored.
fn to_object_path(remote_path: &str) -> Result<ObjectPath> {
    ObjectPath::parse(remote_path.trim_start_matches('/'))
        .map_err(|e| BackupError::Storage(e.into()))
}

fn relative_to<'a>(location: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return location;
    }
    location
        .strip_prefix(prefix)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(location)
}

#[async_trait]
impl StorageEngine for ObjectStorageEngine {
    async fn upload_data(&self, data: Bytes, remote_path: &str) -> Result<String> {
        let path = to_object_path(remote_path)?;
        let payload = PutPayload::from(data);
        let store = &self.store;
        let location = &path;
        retry(&self.retry, "upload_data", move || {
            let payload = payload.clone();
            async move { store.put(location, payload).await.map_err(BackupError::from) }
        })
        .await?;
        Ok(path.to_string())
    }

    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<String> {
        let size = tokio::fs::metadata(local_path).await?.len() as usize;
        let chunk_size = self.chunk_size_for(size);

        if size <= chunk_size {
            let data = tokio::fs::read(local_path).await?;
            return self.upload_data(Bytes::from(data), remote_path).await;
        }

        let upload_id = self.create_multipart_upload(remote_path).await?;
        if let Err(e) = self.upload_chunks(local_path, &upload_id, chunk_size).await {
            if let Err(abort_err) = self.abort_multipart_upload(&upload_id).await {
                warn!(remote_path, error = %abort_err, "Failed to abort multipart upload");
            }
            return Err(e);
        }
        self.complete_multipart_upload(&upload_id).await?;
        Ok(to_object_path(remote_path)?.to_string())
    }

    async fn download_data(&self, remote_path: &str) -> Result<Bytes> {
        let path = to_object_path(remote_path)?;
        let store = &self.store;
        let location = &path;
        retry(&self.retry, "download_data", move || async move {
            let result = store.get(location).await.map_err(BackupError::from)?;
            result.bytes().await.map_err(BackupError::from)
        })
        .await
    }

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let download_id = self.create_multipart_download(remote_path).await?;
        let result = self.write_download(&download_id, local_path).await;
        self.complete_multipart_download(&download_id).await?;
        result
    }

    async fn delete_file(&self, remote_path: &str) -> Result<()> {
        let path = to_object_path(remote_path)?;
        let store = &self.store;
        let location = &path;
        retry(&self.retry, "delete_file", move || async move {
            store.delete(location).await.map_err(BackupError::from)
        })
        .await
    }

    async fn delete_files(&self, remote_paths: &[String]) -> Result<Vec<DeleteOutcome>> {
        let mut outcomes = Vec::with_capacity(remote_paths.len());
        for batch in remote_paths.chunks(self.bulk_delete_chunk_size) {
            outcomes.extend(self.delete_batch(batch).await);
        }
        Ok(outcomes)
    }

    async fn path_exists(&self, remote_path: &str) -> Result<bool> {
        let path = to_object_path(remote_path)?;
        let store = &self.store;
        let location = &path;
        let result = retry(&self.retry, "path_exists", move || async move {
            store.head(location).await.map_err(BackupError::from)
        })
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_dir(&self, remote_path: &str, recursive: bool) -> Result<Vec<String>> {
        let prefix = to_object_path(remote_path)?;
        let prefix_str = prefix.as_ref().to_string();
        let scope = if prefix_str.is_empty() { None } else { Some(&prefix) };
        let store = &self.store;

        if recursive {
            let objects = retry(&self.retry, "list_dir", move || async move {
                store.list(scope).try_collect::<Vec<_>>().await.map_err(BackupError::from)
            })
            .await?;
            return Ok(objects
                .iter()
                .map(|meta| relative_to(meta.location.as_ref(), &prefix_str).to_string())
                .collect());
        }

        let listing = retry(&self.retry, "list_dir", move || async move {
            store.list_with_delimiter(scope).await.map_err(BackupError::from)
        })
        .await?;

        let dirs = listing
            .common_prefixes
            .iter()
            .map(|p| relative_to(p.as_ref(), &prefix_str).to_string());
        let files = listing
            .objects
            .iter()
            .map(|meta| relative_to(meta.location.as_ref(), &prefix_str).to_string());
        Ok(dirs.chain(files).collect())
    }

    async fn create_multipart_upload(&self, remote_path: &str) -> Result<String> {
        let path = to_object_path(remote_path)?;
        let multipart = &self.multipart;
        let location = &path;
        let upload_id = retry(&self.retry, "create_multipart_upload", move || async move {
            multipart.create_multipart(location).await.map_err(BackupError::from)
        })
        .await?;

        debug!(remote_path, upload_id = %upload_id, "Multipart upload created");
        self.uploads.lock().await.insert(
            upload_id.clone(),
            UploadSession {
                path,
                parts: Vec::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(&self, upload_id: &str, data: Bytes) -> Result<()> {
        let (path, part_number) = {
            let uploads = self.uploads.lock().await;
            let session = uploads
                .get(upload_id)
                .ok_or_else(|| BackupError::UnknownSession(upload_id.to_string()))?;
            (session.path.clone(), session.parts.len() + 1)
        };

        let payload = PutPayload::from(data);
        let multipart = &self.multipart;
        let location = &path;
        let id: MultipartId = upload_id.to_string();
        let id = &id;
        let part_id = retry(&self.retry, "upload_part", move || {
            let payload = payload.clone();
            async move {
                multipart
                    .put_part(location, id, part_number - 1, payload)
                    .await
                    .map_err(BackupError::from)
            }
        })
        .await?;

        let mut uploads = self.uploads.lock().await;
        let session = uploads
            .get_mut(upload_id)
            .ok_or_else(|| BackupError::UnknownSession(upload_id.to_string()))?;
        session.parts.push((part_number, part_id));
        Ok(())
    }

    async fn complete_multipart_upload(&self, upload_id: &str) -> Result<()> {
        let session = self
            .uploads
            .lock()
            .await
            .remove(upload_id)
            .ok_or_else(|| BackupError::UnknownSession(upload_id.to_string()))?;

        let mut parts = session.parts;
        parts.sort_by_key(|(number, _)| *number);
        let part_ids: Vec<PartId> = parts.into_iter().map(|(_, id)| id).collect();
        let part_count = part_ids.len();

        let multipart = &self.multipart;
        let location = &session.path;
        let id: MultipartId = upload_id.to_string();
        let id = &id;
        retry(&self.retry, "complete_multipart_upload", move || {
            let part_ids = part_ids.clone();
            async move {
                multipart
                    .complete_multipart(location, id, part_ids)
                    .await
                    .map_err(BackupError::from)
            }
        })
        .await?;

        debug!(path = %session.path, part_count, "Multipart upload completed");
        Ok(())
    }

    async fn abort_multipart_upload(&self, upload_id: &str) -> Result<()> {
        let session = self
            .uploads
            .lock()
            .await
            .remove(upload_id)
            .ok_or_else(|| BackupError::UnknownSession(upload_id.to_string()))?;

        let multipart = &self.multipart;
        let location = &session.path;
        let id: MultipartId = upload_id.to_string();
        let id = &id;
        retry(&self.retry, "abort_multipart_upload", move || async move {
            multipart.abort_multipart(location, id).await.map_err(BackupError::from)
        })
        .await
    }

    async fn create_multipart_download(&self, remote_path: &str) -> Result<String> {
        let path = to_object_path(remote_path)?;
        let store = &self.store;
        let location = &path;
        let meta = retry(&self.retry, "create_multipart_download", move || async move {
            store.head(location).await.map_err(BackupError::from)
        })
        .await?;

        let download_id = uuid::Uuid::new_v4().to_string();
        self.downloads.lock().await.insert(
            download_id.clone(),
            DownloadSession {
                path,
                size: meta.size,
                offset: 0,
            },
        );
        Ok(download_id)
    }

    async fn download_part(
        &self,
        download_id: &str,
        part_len: Option<usize>,
    ) -> Result<Option<Bytes>> {
        let part_len = match part_len {
            Some(0) => {
                return Err(BackupError::InvalidArgument(
                    "part length must be positive".to_string(),
                ))
            }
            Some(len) => len,
            None => self.chunk_size,
        };

        let (path, range) = {
            let downloads = self.downloads.lock().await;
            let session = downloads
                .get(download_id)
                .ok_or_else(|| BackupError::UnknownSession(download_id.to_string()))?;
            if session.offset >= session.size {
                return Ok(None);
            }
            let end = session.size.min(session.offset.saturating_add(part_len));
            (session.path.clone(), session.offset..end)
        };

        let store = &self.store;
        let location = &path;
        let bytes = retry(&self.retry, "download_part", move || {
            let range = range.clone();
            async move {
                store
                    .get_range(location, range)
                    .await
                    .map_err(BackupError::from)
            }
        })
        .await?;

        let mut downloads = self.downloads.lock().await;
        let session = downloads
            .get_mut(download_id)
            .ok_or_else(|| BackupError::UnknownSession(download_id.to_string()))?;
        session.offset += bytes.len();
        Ok(Some(bytes))
    }

    async fn complete_multipart_download(&self, download_id: &str) -> Result<()> {
        self.downloads
            .lock()
            .await
            .remove(download_id)
            .map(|_| ())
            .ok_or_else(|| BackupError::UnknownSession(download_id.to_string()))
    }
}
