//! Background removal of expired objects from the temporary bucket

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::ObjectStore;

pub struct TempSweeper {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    max_age: Duration,
    sweep_task: RwLock<Option<JoinHandle<()>>>,
}

impl TempSweeper {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, max_age: Duration) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            max_age,
            sweep_task: RwLock::new(None),
        }
    }

    /// One pass over the bucket
    pub async fn sweep_once(&self) -> Result<usize> {
        let removed = self.store.sweep_expired(&self.bucket, self.max_age).await?;
        debug!(bucket = %self.bucket, removed, "Temporary bucket swept");
        Ok(removed)
    }

    /// Start the background sweep task
    pub async fn start(&self, interval: Duration) {
        let store = self.store.clone();
        let bucket = self.bucket.clone();
        let max_age = self.max_age;

        let handle = tokio::spawn(async move {
            loop {
                match store.sweep_expired(&bucket, max_age).await {
                    Ok(0) => debug!(bucket = %bucket, "Nothing to sweep"),
                    Ok(removed) => info!(bucket = %bucket, removed, "Removed expired temporary objects"),
                    Err(e) => warn!(bucket = %bucket, error = %e, "Temporary bucket sweep failed"),
                }
                tokio::time::sleep(interval).await;
            }
        });

        if let Some(previous) = self.sweep_task.write().await.replace(handle) {
            previous.abort();
        }
        info!(
            bucket = %self.bucket,
            interval_secs = interval.as_secs(),
            max_age_secs = self.max_age.as_secs(),
            "Started temporary bucket sweep"
        );
    }

    /// Stop the background sweep task
    pub async fn stop(&self) {
        if let Some(handle) = self.sweep_task.write().await.take() {
            handle.abort();
            info!(bucket = %self.bucket, "Stopped temporary bucket sweep");
        }
    }
}
