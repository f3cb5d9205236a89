//! Filesystem-backed object store

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::storage::ObjectStore;

/// Stores objects at `{base_path}/{bucket}/{path}` and serves them under
/// `{url_prefix}/{bucket}/{path}`
pub struct LocalObjectStore {
    base_path: PathBuf,
    url_prefix: String,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Full path for an object
    pub fn get_path(&self, bucket: &str, path: &str) -> PathBuf {
        self.base_path.join(bucket).join(path)
    }

    /// Read an object back
    pub async fn read(&self, bucket: &str, path: &str) -> Result<Vec<u8>> {
        fs::read(self.get_path(bucket, path)).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                AppError::NotFound(format!("{}/{}", bucket, path))
            } else {
                AppError::Io(e)
            }
        })
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') || path.split('/').any(|c| c == ".." || c.is_empty()) {
        return Err(AppError::Storage(format!("Invalid object path '{}'", path)));
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<String> {
        validate_path(path)?;
        let file_path = self.get_path(bucket, path);

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if upsert {
            fs::write(&file_path, &bytes).await?;
        } else {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&file_path)
                .await
                .map_err(|e| {
                    if e.kind() == ErrorKind::AlreadyExists {
                        AppError::StorageConflict(format!("{}/{}", bucket, path))
                    } else {
                        AppError::Io(e)
                    }
                })?;
            file.write_all(&bytes).await?;
            file.flush().await?;
        }

        debug!(path = ?file_path, size = bytes.len(), content_type, "Stored object");
        Ok(self.public_url(bucket, path))
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<usize> {
        let mut removed = 0;
        for path in paths {
            validate_path(path)?;
            match fs::remove_file(self.get_path(bucket, path)).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(AppError::Io(e)),
            }
        }
        Ok(removed)
    }

    async fn sweep_expired(&self, bucket: &str, max_age: Duration) -> Result<usize> {
        let root = self.base_path.join(bucket);
        if !fs::try_exists(&root).await? {
            return Ok(0);
        }

        let now = SystemTime::now();
        let mut deleted = 0;
        let mut pending = vec![root];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let metadata = match entry.metadata().await {
                    Ok(metadata) => metadata,
                    Err(_) => continue,
                };
                if metadata.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let expired = metadata
                    .modified()
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .is_some_and(|age| age > max_age);
                if expired && fs::remove_file(entry.path()).await.is_ok() {
                    deleted += 1;
                    debug!(path = ?entry.path(), "Deleted expired object");
                }
            }
        }

        if deleted > 0 {
            info!(bucket, deleted, "Swept expired objects");
        }
        Ok(deleted)
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/{}/{}", self.url_prefix, bucket, path)
    }

    fn owns_url(&self, url: &str) -> bool {
        url.starts_with(&format!("{}/", self.url_prefix))
    }
}
