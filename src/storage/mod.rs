//! Object storage: bucket clients, deterministic asset paths and relocation

pub mod base64;
pub mod local;
pub mod media;
pub mod relocate;
pub mod supabase;
pub mod sweep;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::job::model::{BatchId, ToolId};

pub use local::LocalObjectStore;
pub use relocate::AssetRelocator;
pub use supabase::SupabaseObjectStore;
pub use sweep::TempSweeper;

/// Bucket-addressed blob storage owned by the application
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` at `path` and return its public URL.
    ///
    /// Without `upsert`, writing over an existing object is
    /// [`crate::AppError::StorageConflict`].
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<String>;

    /// Delete objects; returns how many were removed
    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<usize>;

    /// Delete objects older than `max_age`
    async fn sweep_expired(&self, bucket: &str, max_age: Duration) -> Result<usize>;

    /// Public URL for an object, whether or not it exists yet
    fn public_url(&self, bucket: &str, path: &str) -> String;

    /// Whether `url` points into this store
    fn owns_url(&self, url: &str) -> bool;
}

/// Deterministic location of a relocated asset:
/// `{user}/{tool}/{batch}/{segment}.{ext}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetKey {
    pub user_id: String,
    pub tool: ToolId,
    pub batch_id: BatchId,
    pub segment: String,
}

impl AssetKey {
    pub fn new(
        user_id: impl Into<String>,
        tool: ToolId,
        batch_id: BatchId,
        segment: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            tool,
            batch_id,
            segment: segment.into(),
        }
    }

    /// Key for the n-th output of the same job
    pub fn indexed(&self, index: usize) -> Self {
        let mut key = self.clone();
        if index > 0 {
            key.segment = format!("{}-{}", self.segment, index);
        }
        key
    }

    pub fn path(&self, extension: &str) -> String {
        format!(
            "{}/{}/{}/{}.{}",
            sanitize_component(&self.user_id),
            self.tool.as_str(),
            sanitize_component(self.batch_id.as_str()),
            sanitize_component(&self.segment),
            sanitize_component(extension),
        )
    }
}

/// Keep path components to `[A-Za-z0-9_-]` so ids can't escape their prefix
fn sanitize_component(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// A blob written to application storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAsset {
    pub url: String,
    pub bucket: String,
    pub path: String,
    pub content_type: String,
    pub size: usize,
    /// Vendor URL the asset was fetched from
    pub source_url: String,
}
