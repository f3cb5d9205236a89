//! In-process job repository

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::job::model::{BatchId, JobRecord};
use crate::persistence::JobRepository;

#[derive(Default)]
pub struct InMemoryJobRepository {
    rows: DashMap<String, JobRecord>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn upsert(&self, record: &JobRecord) -> Result<()> {
        let mut entry = self
            .rows
            .entry(record.job_id.clone())
            .or_insert_with(|| record.clone());

        let existing = entry.value();
        if existing.status.is_terminal() && existing != record {
            return Err(AppError::InvalidTransition {
                job_id: record.job_id.clone(),
                from: existing.status,
                to: record.status,
            });
        }

        *entry.value_mut() = record.clone();
        debug!(job_id = %record.job_id, status = %record.status, "Persisted job row");
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.rows.get(job_id).map(|row| row.value().clone()))
    }

    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<JobRecord>> {
        let mut rows: Vec<JobRecord> = self
            .rows
            .iter()
            .filter(|row| row.user_id == user_id)
            .map(|row| row.value().clone())
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list_batch(&self, batch_id: &BatchId) -> Result<Vec<JobRecord>> {
        let mut rows: Vec<JobRecord> = self
            .rows
            .iter()
            .filter(|row| row.batch_id.as_ref() == Some(batch_id))
            .map(|row| row.value().clone())
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }
}
