//! Deadline-bounded polling of vendor jobs
//!
//! The wait is an ordinary future: each tick suspends on `tokio::time`, and
//! dropping the future stops polling locally. The vendor-side job keeps
//! running unless the caller cancels it explicitly.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::vendor::traits::{JobSnapshot, VendorStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Fixed delay between status fetches
    pub interval: Duration,
    /// Wall-clock budget for the whole wait
    pub max_wait: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(300),
        }
    }
}

/// Notified whenever the observed vendor status changes
#[async_trait]
pub trait PollObserver: Send + Sync {
    async fn on_transition(&self, snapshot: &JobSnapshot) -> Result<()>;
}

/// Observer that ignores transitions
pub struct NoopObserver;

#[async_trait]
impl PollObserver for NoopObserver {
    async fn on_transition(&self, _snapshot: &JobSnapshot) -> Result<()> {
        Ok(())
    }
}

pub struct Poller {
    config: PollConfig,
}

impl Poller {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> PollConfig {
        self.config
    }

    /// Fetch until the job reaches `succeeded`, `failed` or `canceled`.
    ///
    /// Vendor-reported failures come back as `Ok`; only an exhausted budget
    /// yields [`AppError::PollTimeout`]. Fetch errors are returned as-is.
    pub async fn wait<F, Fut>(
        &self,
        job_id: &str,
        mut fetch: F,
        observer: &dyn PollObserver,
    ) -> Result<JobSnapshot>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<JobSnapshot>>,
    {
        let started = Instant::now();
        let deadline = started + self.config.max_wait;
        let timed_out = || AppError::PollTimeout {
            job_id: job_id.to_string(),
            waited: started.elapsed(),
        };

        let mut last_status: Option<VendorStatus> = None;
        let mut polls: u32 = 0;

        loop {
            let snapshot = timeout_at(deadline, fetch())
                .await
                .map_err(|_| timed_out())??;
            polls += 1;

            if last_status.as_ref() != Some(&snapshot.status) {
                debug!(job_id = %job_id, status = ?snapshot.status, polls, "Job status changed");
                observer.on_transition(&snapshot).await?;
                last_status = Some(snapshot.status.clone());
            }

            if snapshot.status.is_terminal() {
                info!(
                    job_id = %job_id,
                    status = ?snapshot.status,
                    polls,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job reached terminal state"
                );
                return Ok(snapshot);
            }

            let next_tick = Instant::now() + self.config.interval;
            if next_tick >= deadline {
                sleep_until(deadline).await;
                return Err(timed_out());
            }
            sleep_until(next_tick).await;
        }
    }
}
