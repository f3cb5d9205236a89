//! Job repository over PostgREST (Supabase)

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SupabaseConfig;
use crate::error::{AppError, Result};
use crate::job::model::{BatchId, JobRecord};
use crate::persistence::JobRepository;

pub struct RestJobRepository {
    client: Client,
    base_url: String,
    service_key: String,
    table: String,
}

impl RestJobRepository {
    pub fn new(config: &SupabaseConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            table: config.jobs_table.clone(),
        })
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{}", self.base_url, self.table))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
    }

    async fn select(&self, query: &[(&str, String)]) -> Result<Vec<JobRecord>> {
        let response = self
            .request(reqwest::Method::GET)
            .query(&[("select", "*".to_string())])
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Persistence(format!(
                "Select from {} failed with {}: {}",
                self.table, status, body
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl JobRepository for RestJobRepository {
    async fn upsert(&self, record: &JobRecord) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST)
            .query(&[("on_conflict", "job_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[record])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(job_id = %record.job_id, status = %status, "Job row upsert failed");
            return Err(AppError::Persistence(format!(
                "Upsert into {} failed with {}: {}",
                self.table, status, body
            )));
        }

        debug!(job_id = %record.job_id, status = %record.status, "Persisted job row");
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self
            .select(&[("job_id", format!("eq.{}", job_id))])
            .await?
            .into_iter()
            .next())
    }

    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<JobRecord>> {
        self.select(&[
            ("user_id", format!("eq.{}", user_id)),
            ("order", "created_at.desc".to_string()),
            ("limit", limit.to_string()),
        ])
        .await
    }

    async fn list_batch(&self, batch_id: &BatchId) -> Result<Vec<JobRecord>> {
        self.select(&[
            ("batch_id", format!("eq.{}", batch_id)),
            ("order", "created_at.asc".to_string()),
        ])
        .await
    }
}
