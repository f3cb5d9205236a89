//! Copies vendor-hosted artifacts into application storage
//!
//! Vendor URLs expire on the vendor's schedule; everything handed back to
//! users is re-hosted here first.

use reqwest::{header::CONTENT_TYPE, Client};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::storage::{base64, media, AssetKey, ObjectStore, StoredAsset};

pub struct AssetRelocator {
    client: Client,
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl AssetRelocator {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, fetch_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            store,
            bucket: bucket.into(),
        })
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Fetch `source_url` and store it under `key`. Re-running the same
    /// relocation overwrites the previous copy.
    pub async fn relocate(&self, source_url: &str, key: &AssetKey) -> Result<StoredAsset> {
        let (bytes, declared_type) = self.fetch(source_url).await?;

        let content_type = declared_type
            .filter(|t| !t.is_empty() && t != "application/octet-stream")
            .or_else(|| media::detect_content_type(&bytes).map(str::to_string))
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let path = key.path(media::extension_for(&content_type));
        let size = bytes.len();

        let url = self
            .store
            .upload(&self.bucket, &path, bytes, &content_type, true)
            .await
            .map_err(|e| AppError::Relocation {
                source_url: redact(source_url),
                reason: e.to_string(),
            })?;

        info!(path = %path, size, content_type = %content_type, "Relocated asset");

        Ok(StoredAsset {
            url,
            bucket: self.bucket.clone(),
            path,
            content_type,
            size,
            source_url: redact(source_url),
        })
    }

    /// Relocate every output of one job, numbering them after the first
    pub async fn relocate_all(&self, source_urls: &[String], key: &AssetKey) -> Result<Vec<StoredAsset>> {
        let mut assets = Vec::with_capacity(source_urls.len());
        for (index, url) in source_urls.iter().enumerate() {
            assets.push(self.relocate(url, &key.indexed(index)).await?);
        }
        Ok(assets)
    }

    async fn fetch(&self, source_url: &str) -> Result<(Vec<u8>, Option<String>)> {
        if base64::is_data_url(source_url) {
            let bytes = base64::decode(source_url).map_err(|e| AppError::Relocation {
                source_url: redact(source_url),
                reason: e.to_string(),
            })?;
            let media_type = base64::media_type_from_data_url(source_url).map(str::to_string);
            return Ok((bytes, media_type));
        }

        debug!(source_url = %source_url, "Fetching vendor artifact");

        let failed = |reason: String| AppError::Relocation {
            source_url: source_url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(source_url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("fetch returned {}", status)));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| failed(e.to_string()))?
            .to_vec();

        Ok((bytes, content_type))
    }
}

/// Data URLs can be megabytes long; keep only the header in errors and records
fn redact(source_url: &str) -> String {
    match source_url.split_once(',') {
        Some((header, _)) if base64::is_data_url(source_url) => format!("{},...", header),
        _ => source_url.to_string(),
    }
}
