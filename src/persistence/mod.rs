//! Job history persistence
//!
//! Rows are an audit trail and feed history views. Nothing in a request reads
//! them back to decide what to do next.

pub mod memory;
pub mod rest;

use async_trait::async_trait;

use crate::error::Result;
use crate::job::model::{BatchId, JobRecord};

pub use memory::InMemoryJobRepository;
pub use rest::RestJobRepository;

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert or update the row keyed by `record.job_id`
    async fn upsert(&self, record: &JobRecord) -> Result<()>;

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>>;

    /// Most recent jobs first
    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<JobRecord>>;

    /// Jobs of one batch, oldest first
    async fn list_batch(&self, batch_id: &BatchId) -> Result<Vec<JobRecord>>;
}
