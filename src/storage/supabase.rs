//! Supabase storage REST client

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SupabaseConfig;
use crate::error::{AppError, Result};
use crate::storage::ObjectStore;

const LIST_PAGE_SIZE: usize = 1000;

pub struct SupabaseObjectStore {
    client: Client,
    base_url: String,
    service_key: String,
}

#[derive(Debug, Serialize)]
struct RemoveRequest<'a> {
    prefixes: &'a [String],
}

#[derive(Debug, Serialize)]
struct ListRequest<'a> {
    prefix: &'a str,
    limit: usize,
    offset: usize,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
    /// Folders come back without an id
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl SupabaseObjectStore {
    pub fn new(config: &SupabaseConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/storage/v1{}", self.base_url, path))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ListedObject>> {
        let mut objects = Vec::new();
        let mut offset = 0;

        loop {
            let response = self
                .request(reqwest::Method::POST, &format!("/object/list/{}", bucket))
                .json(&ListRequest {
                    prefix,
                    limit: LIST_PAGE_SIZE,
                    offset,
                })
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(AppError::Storage(format!(
                    "List of {}/{} failed with {}: {}",
                    bucket, prefix, status, body
                )));
            }

            let page: Vec<ListedObject> = response.json().await?;
            let fetched = page.len();
            objects.extend(page);
            if fetched < LIST_PAGE_SIZE {
                return Ok(objects);
            }
            offset += fetched;
        }
    }
}

#[async_trait]
impl ObjectStore for SupabaseObjectStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<String> {
        let size = bytes.len();
        let response = self
            .request(reqwest::Method::POST, &format!("/object/{}/{}", bucket, path))
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", if upsert { "true" } else { "false" })
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::CONFLICT || body.contains("already exists") || body.contains("Duplicate") {
                return Err(AppError::StorageConflict(format!("{}/{}", bucket, path)));
            }
            warn!(bucket, path, status = %status, "Storage upload failed");
            return Err(AppError::Storage(format!(
                "Upload of {}/{} failed with {}: {}",
                bucket, path, status, body
            )));
        }

        debug!(bucket, path, size, "Uploaded object");
        Ok(self.public_url(bucket, path))
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }

        let response = self
            .request(reqwest::Method::DELETE, &format!("/object/{}", bucket))
            .json(&RemoveRequest { prefixes: paths })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Storage(format!(
                "Delete in {} failed with {}: {}",
                bucket, status, body
            )));
        }

        let removed: Vec<serde_json::Value> = response.json().await?;
        Ok(removed.len())
    }

    async fn sweep_expired(&self, bucket: &str, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| AppError::Internal(format!("Invalid sweep age: {}", e)))?;

        let mut expired = Vec::new();
        let mut prefixes = vec![String::new()];

        while let Some(prefix) = prefixes.pop() {
            for object in self.list(bucket, &prefix).await? {
                let full_path = if prefix.is_empty() {
                    object.name.clone()
                } else {
                    format!("{}/{}", prefix, object.name)
                };
                match (object.id, object.created_at) {
                    (None, _) => prefixes.push(full_path),
                    (Some(_), Some(created_at)) if created_at < cutoff => expired.push(full_path),
                    _ => {}
                }
            }
        }

        let deleted = self.remove(bucket, &expired).await?;
        if deleted > 0 {
            info!(bucket, deleted, "Swept expired objects");
        }
        Ok(deleted)
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, bucket, path)
    }

    fn owns_url(&self, url: &str) -> bool {
        url.starts_with(&format!("{}/storage/v1/object/", self.base_url))
    }
}
