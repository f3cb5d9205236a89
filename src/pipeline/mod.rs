//! Tool invocation pipeline: admit, submit, charge, poll, relocate, record
//!
//! Every tool action runs the same linear sequence inside the calling
//! request. Clients are injected at construction; nothing here is global.

pub mod batch;
pub mod safety;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::PollingConfig;
use crate::credits::{CreditLedger, CreditPricing};
use crate::error::{AppError, Result};
use crate::job::classify::{classify, FailureClass};
use crate::job::model::{BatchId, JobRecord, JobStatus, MediaKind, ToolId};
use crate::job::poller::{PollObserver, Poller};
use crate::persistence::JobRepository;
use crate::storage::{AssetKey, AssetRelocator, StoredAsset};
use crate::vendor::{JobOutput, JobSnapshot, SubmitRequest, VendorRegistry, VendorStatus};

pub use batch::{BatchItem, BatchOutcome, BatchRequest, FailedSegment, JoinPolicy, SegmentResult};
pub use safety::{sanitize_prompt, SafetyRetryPolicy};

/// Longest prompt accepted by image tools
pub const MAX_PROMPT_CHARS: usize = 2000;

/// One tool invocation on behalf of a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub user_id: String,
    pub tool: ToolId,
    pub model_version: String,
    pub input: serde_json::Value,
    #[serde(default)]
    pub batch_id: Option<BatchId>,
    #[serde(default)]
    pub segment: Option<String>,
}

impl ToolRequest {
    pub fn new(
        user_id: impl Into<String>,
        tool: ToolId,
        model_version: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            tool,
            model_version: model_version.into(),
            input,
            batch_id: None,
            segment: None,
        }
    }

    pub fn with_batch(mut self, batch_id: BatchId, segment: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id);
        self.segment = Some(segment.into());
        self
    }

    pub fn prompt(&self) -> Option<&str> {
        self.input.get("prompt").and_then(|p| p.as_str())
    }

    /// Check identity and input shape before anything is spent
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(AppError::AuthenticationFailed("No authenticated user".to_string()));
        }
        if self.model_version.trim().is_empty() {
            return Err(AppError::InvalidRequest("model_version is required".to_string()));
        }
        if !self.input.is_object() {
            return Err(AppError::InvalidRequest("input must be a JSON object".to_string()));
        }

        match self.tool.media_kind() {
            MediaKind::Image => {
                let prompt = self.prompt().map(str::trim).unwrap_or_default();
                if prompt.is_empty() {
                    return Err(AppError::InvalidRequest("prompt is required".to_string()));
                }
                if prompt.chars().count() > MAX_PROMPT_CHARS {
                    return Err(AppError::InvalidRequest(format!(
                        "prompt is longer than {} characters",
                        MAX_PROMPT_CHARS
                    )));
                }
            }
            _ if self.tool == ToolId::Transcription => {
                let audio_url = self
                    .input
                    .get("audio_url")
                    .and_then(|u| u.as_str())
                    .unwrap_or_default();
                if !(audio_url.starts_with("https://") || audio_url.starts_with("http://")) {
                    return Err(AppError::InvalidRequest(
                        "audio_url must be an http(s) URL".to_string(),
                    ));
                }
            }
            _ => {}
        }

        Ok(())
    }
}

/// Result of a successful tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub job_id: String,
    pub tool: ToolId,
    pub batch_id: BatchId,
    pub status: JobStatus,
    /// Relocated media, all inside application storage
    pub assets: Vec<StoredAsset>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Input of the attempt that succeeded
    pub input: serde_json::Value,
    pub attempts: u32,
    pub credits_charged: u32,
    /// Deduction after submission failed; left for manual reconciliation
    pub credit_shortfall: bool,
    /// False when the terminal history row could not be written
    pub history_recorded: bool,
}

/// Credit bookkeeping across the attempts of one invocation
#[derive(Debug, Default)]
struct ChargeState {
    pending: u32,
    charged: u32,
    shortfall: bool,
}

impl ChargeState {
    fn new(cost: u32) -> Self {
        Self {
            pending: cost,
            ..Self::default()
        }
    }
}

/// Persists non-terminal status changes seen while polling
struct RecordingObserver {
    repository: Arc<dyn JobRepository>,
    record: Mutex<JobRecord>,
}

#[async_trait]
impl PollObserver for RecordingObserver {
    async fn on_transition(&self, snapshot: &JobSnapshot) -> Result<()> {
        // Terminal states are written once outputs are relocated
        if snapshot.status.is_terminal() {
            return Ok(());
        }
        let status = snapshot.status.to_job_status();
        let mut record = self.record.lock().await;
        if record.status == status {
            return Ok(());
        }
        record.transition(status, None, None)?;
        // History is best effort; a missed intermediate row never stops the job
        if let Err(e) = self.repository.upsert(&record).await {
            warn!(job_id = %record.job_id, status = %status, error = %e, "Failed to record job progress");
        }
        Ok(())
    }
}

pub struct JobPipeline {
    vendors: Arc<VendorRegistry>,
    ledger: Arc<dyn CreditLedger>,
    repository: Arc<dyn JobRepository>,
    relocator: Arc<AssetRelocator>,
    pricing: CreditPricing,
    polling: PollingConfig,
    safety: SafetyRetryPolicy,
}

impl JobPipeline {
    pub fn new(
        vendors: Arc<VendorRegistry>,
        ledger: Arc<dyn CreditLedger>,
        repository: Arc<dyn JobRepository>,
        relocator: Arc<AssetRelocator>,
        pricing: CreditPricing,
        polling: PollingConfig,
    ) -> Self {
        Self {
            vendors,
            ledger,
            repository,
            relocator,
            pricing,
            polling,
            safety: SafetyRetryPolicy::default(),
        }
    }

    pub fn with_safety_policy(mut self, safety: SafetyRetryPolicy) -> Self {
        self.safety = safety;
        self
    }

    pub fn vendors(&self) -> &Arc<VendorRegistry> {
        &self.vendors
    }

    pub fn ledger(&self) -> &Arc<dyn CreditLedger> {
        &self.ledger
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    /// Run a tool, with the content-safety retry for tools that support it
    pub async fn invoke(&self, request: ToolRequest) -> Result<ToolOutcome> {
        let charge = ChargeState::new(self.pricing.cost_for(request.tool)?);
        self.invoke_with(request, charge).await
    }

    /// `invoke` with caller-supplied bookkeeping. A zero-cost state skips both
    /// the admission check and the deduction.
    async fn invoke_with(
        &self,
        request: ToolRequest,
        mut charge: ChargeState,
    ) -> Result<ToolOutcome> {
        if request.tool.is_safety_aware() {
            self.retry_on_content_policy(request, &self.safety, &mut charge).await
        } else {
            self.execute(&request, &mut charge, 1).await
        }
    }

    /// Run a tool once. Vendor failures come back as [`AppError::VendorFailure`].
    pub async fn run(&self, request: ToolRequest) -> Result<ToolOutcome> {
        let mut charge = ChargeState::new(self.pricing.cost_for(request.tool)?);
        self.execute(&request, &mut charge, 1).await
    }

    /// Run a tool, retrying once with a sanitised prompt and relaxed safety
    /// tolerance if the vendor rejects it on content-policy grounds. Credits
    /// are charged once for the whole invocation.
    pub async fn run_with_safety_retry(
        &self,
        request: ToolRequest,
        policy: &SafetyRetryPolicy,
    ) -> Result<ToolOutcome> {
        let mut charge = ChargeState::new(self.pricing.cost_for(request.tool)?);
        self.retry_on_content_policy(request, policy, &mut charge).await
    }

    async fn retry_on_content_policy(
        &self,
        request: ToolRequest,
        policy: &SafetyRetryPolicy,
        charge: &mut ChargeState,
    ) -> Result<ToolOutcome> {
        let mut current = request;
        let mut attempt = 1;

        loop {
            match self.execute(&current, charge, attempt).await {
                Err(AppError::VendorFailure {
                    job_id,
                    class: FailureClass::ContentPolicy,
                    message,
                    ..
                }) if attempt <= policy.max_retries => {
                    info!(
                        job_id = %job_id,
                        user_id = %current.user_id,
                        tool = %current.tool,
                        attempt,
                        error = %message,
                        "Content policy rejection, retrying with sanitized prompt"
                    );
                    current.input = policy.relax_input(&current.input);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn execute(
        &self,
        request: &ToolRequest,
        charge: &mut ChargeState,
        attempt: u32,
    ) -> Result<ToolOutcome> {
        request.validate()?;
        let vendor = self.vendors.for_tool(request.tool)?;

        if charge.pending > 0 {
            let balance = self.ledger.balance(&request.user_id).await?;
            if balance.available < charge.pending {
                return Err(AppError::InsufficientCredits {
                    required: charge.pending,
                    available: balance.available,
                });
            }
        }

        let descriptor = vendor
            .submit(&SubmitRequest {
                model_version: request.model_version.clone(),
                input: request.input.clone(),
            })
            .await?;

        let batch_id = request.batch_id.clone().unwrap_or_else(BatchId::generate);
        let mut record = JobRecord::submitted(
            descriptor.id.clone(),
            request.user_id.clone(),
            request.tool,
            vendor.vendor(),
            request.model_version.clone(),
            request.input.clone(),
        )
        .with_batch(Some(batch_id.clone()), request.segment.clone());
        if let Some(created_at) = descriptor.created_at {
            record.created_at = created_at;
        }
        self.repository.upsert(&record).await?;

        info!(
            job_id = %record.job_id,
            user_id = %record.user_id,
            tool = %record.tool,
            vendor = %record.vendor,
            batch_id = %batch_id,
            attempt,
            "Job submitted"
        );

        if charge.pending > 0 {
            self.charge(&request.user_id, &record.job_id, charge).await;
        }

        let job_id = record.job_id.clone();
        let observer = RecordingObserver {
            repository: self.repository.clone(),
            record: Mutex::new(record),
        };
        let poller = Poller::new(self.polling.poll_config(request.tool.media_kind()));
        let polled = poller
            .wait(&job_id, || vendor.fetch(&job_id), &observer)
            .await;
        let mut record = observer.record.into_inner();

        let snapshot = match polled {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let status = match e {
                    AppError::PollTimeout { .. } => JobStatus::TimedOut,
                    _ => JobStatus::Failed,
                };
                warn!(job_id = %job_id, error = %e, "Polling ended without a vendor result");
                self.finish(&mut record, status, None, Some(e.to_string())).await;
                return Err(e);
            }
        };

        match snapshot.status {
            VendorStatus::Succeeded => {
                self.complete(request, record, snapshot.output, batch_id, attempt, charge)
                    .await
            }
            ref status => {
                let job_status = status.to_job_status();
                let message = snapshot.error.clone().unwrap_or_else(|| match job_status {
                    JobStatus::Canceled => "Job was canceled".to_string(),
                    _ => "Job failed without an error message".to_string(),
                });
                let class = match job_status {
                    JobStatus::Canceled => FailureClass::Unknown,
                    _ => classify(&message),
                };
                warn!(job_id = %job_id, status = %job_status, class = %class, error = %message, "Job failed at vendor");
                self.finish(&mut record, job_status, None, Some(message.clone()))
                    .await;
                Err(AppError::VendorFailure {
                    job_id,
                    status: job_status,
                    class,
                    message,
                })
            }
        }
    }

    /// Relocate outputs and write the succeeded row
    async fn complete(
        &self,
        request: &ToolRequest,
        mut record: JobRecord,
        output: Option<JobOutput>,
        batch_id: BatchId,
        attempts: u32,
        charge: &ChargeState,
    ) -> Result<ToolOutcome> {
        let segment = request
            .segment
            .clone()
            .unwrap_or_else(|| record.job_id.clone());
        let key = AssetKey::new(request.user_id.clone(), request.tool, batch_id.clone(), segment);

        let (assets, text, data) = match output {
            Some(JobOutput::Urls(urls)) => match self.relocator.relocate_all(&urls, &key).await {
                Ok(assets) => (assets, None, None),
                Err(e) => {
                    error!(job_id = %record.job_id, error = %e, "Asset relocation failed");
                    self.finish(&mut record, JobStatus::Failed, None, Some(e.to_string()))
                        .await;
                    return Err(e);
                }
            },
            Some(JobOutput::Text(text)) => (Vec::new(), Some(text), None),
            Some(JobOutput::Json(value)) => (Vec::new(), None, Some(value)),
            None => (Vec::new(), None, None),
        };

        let output_row = json!({
            "assets": assets.iter().map(|a| a.url.as_str()).collect::<Vec<_>>(),
            "text": text,
            "data": data,
        });
        let history_recorded = self
            .finish(&mut record, JobStatus::Succeeded, Some(output_row), None)
            .await;

        info!(
            job_id = %record.job_id,
            user_id = %record.user_id,
            tool = %record.tool,
            assets = assets.len(),
            "Job succeeded"
        );

        Ok(ToolOutcome {
            job_id: record.job_id,
            tool: request.tool,
            batch_id,
            status: JobStatus::Succeeded,
            assets,
            text,
            data,
            input: request.input.clone(),
            attempts,
            credits_charged: charge.charged,
            credit_shortfall: charge.shortfall,
            history_recorded,
        })
    }

    /// Deduct once the vendor has the work (after submission for single
    /// jobs, after success for batch segments). A failed deduction does not
    /// stop the job.
    async fn charge(&self, user_id: &str, job_id: &str, state: &mut ChargeState) {
        let cost = state.pending;
        state.pending = 0;
        match self.ledger.deduct(user_id, cost).await {
            Ok(outcome) if outcome.success => state.charged += cost,
            Ok(outcome) => {
                warn!(
                    user_id,
                    job_id,
                    cost,
                    remaining = outcome.remaining,
                    "Credit deduction refused after submission; needs reconciliation"
                );
                state.shortfall = true;
            }
            Err(e) => {
                warn!(user_id, job_id, cost, error = %e, "Credit deduction failed after submission; needs reconciliation");
                state.shortfall = true;
            }
        }
    }

    /// Write a terminal row; returns whether it was persisted
    async fn finish(
        &self,
        record: &mut JobRecord,
        status: JobStatus,
        output: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> bool {
        let written = match record.transition(status, output, error_message) {
            Ok(()) => self.repository.upsert(record).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => true,
            Err(e) => {
                error!(job_id = %record.job_id, status = %status, error = %e, "Failed to record job outcome");
                false
            }
        }
    }

    /// Ask the vendor to cancel a job the user owns. The invocation that
    /// owns the job records the canceled state when it observes it.
    pub async fn cancel(&self, user_id: &str, job_id: &str) -> Result<JobStatus> {
        let record = self
            .repository
            .get(job_id)
            .await?
            .filter(|record| record.user_id == user_id)
            .ok_or_else(|| AppError::NotFound(format!("Job {}", job_id)))?;

        if matches!(
            record.status,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        ) {
            return Err(AppError::InvalidRequest(format!(
                "Job {} already finished as {}",
                job_id, record.status
            )));
        }

        let vendor = self.vendors.get(record.vendor)?;
        let snapshot = vendor.cancel(job_id).await?;
        info!(job_id, user_id, status = ?snapshot.status, "Cancel requested at vendor");
        Ok(snapshot.status.to_job_status())
    }
}
