//! Concurrent fan-out of sibling jobs with a configurable join

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::job::model::{BatchId, ToolId};
use crate::pipeline::{ChargeState, JobPipeline, ToolOutcome, ToolRequest};

/// How sibling results are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Any failure fails the batch
    AllOrNothing,
    /// Failures are reported per segment next to the successes
    #[default]
    PartialSuccess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub segment: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub user_id: String,
    pub tool: ToolId,
    pub model_version: String,
    pub items: Vec<BatchItem>,
    #[serde(default)]
    pub join: JoinPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentResult {
    pub segment: String,
    pub outcome: ToolOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedSegment {
    pub segment: String,
    #[serde(default)]
    pub prompt: Option<String>,
    pub error: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch_id: BatchId,
    pub succeeded: Vec<SegmentResult>,
    pub failed: Vec<FailedSegment>,
    pub partial_failure: bool,
    /// Credits deducted for the segments that succeeded
    pub credits_used: u32,
}

impl JobPipeline {
    /// Run one pipeline per item concurrently and join per `request.join`.
    ///
    /// The batch is admitted against its total cost before anything is
    /// submitted. Segments are billed only once they succeed, so
    /// `credits_used` is exactly what left the ledger. A failed
    /// `AllOrNothing` batch bills nothing.
    pub async fn run_batch(&self, request: BatchRequest) -> Result<BatchOutcome> {
        if request.items.is_empty() {
            return Err(AppError::InvalidRequest("Batch has no items".to_string()));
        }

        let batch_id = BatchId::generate();
        let requests: Vec<ToolRequest> = request
            .items
            .iter()
            .map(|item| {
                ToolRequest::new(
                    request.user_id.clone(),
                    request.tool,
                    request.model_version.clone(),
                    item.input.clone(),
                )
                .with_batch(batch_id.clone(), item.segment.clone())
            })
            .collect();

        // Malformed items fail an all-or-nothing batch before anything is submitted
        if request.join == JoinPolicy::AllOrNothing {
            requests.iter().try_for_each(ToolRequest::validate)?;
        }

        let cost = self.pricing.cost_for(request.tool)?;
        self.admit_batch(&request.user_id, cost, requests.len()).await?;

        info!(
            batch_id = %batch_id,
            user_id = %request.user_id,
            tool = %request.tool,
            items = requests.len(),
            join = ?request.join,
            "Starting batch"
        );

        // Every sibling runs to a terminal row before the batch is judged
        let results = join_all(
            requests
                .into_iter()
                .map(|r| self.invoke_with(r, ChargeState::default())),
        )
        .await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut first_error = None;

        for (item, result) in request.items.iter().zip(results) {
            match result {
                Ok(outcome) => succeeded.push(SegmentResult {
                    segment: item.segment.clone(),
                    outcome,
                }),
                Err(e) => {
                    warn!(batch_id = %batch_id, segment = %item.segment, error = %e, "Batch segment failed");
                    failed.push(FailedSegment {
                        segment: item.segment.clone(),
                        prompt: item
                            .input
                            .get("prompt")
                            .and_then(|p| p.as_str())
                            .map(str::to_string),
                        error: e.to_string(),
                        code: e.code().to_string(),
                    });
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if request.join == JoinPolicy::AllOrNothing {
            if let Some(e) = first_error {
                warn!(
                    batch_id = %batch_id,
                    failed = failed.len(),
                    "All-or-nothing batch failed, nothing billed"
                );
                return Err(e);
            }
        }

        if succeeded.is_empty() {
            return Err(AppError::BatchFailed {
                failed: failed.len(),
                first_error: failed
                    .first()
                    .map(|f| f.error.clone())
                    .unwrap_or_default(),
            });
        }

        let mut credits_used = 0;
        for result in &mut succeeded {
            let mut charge = ChargeState::new(cost);
            self.charge(&request.user_id, &result.outcome.job_id, &mut charge)
                .await;
            result.outcome.credits_charged = charge.charged;
            result.outcome.credit_shortfall = charge.shortfall;
            credits_used += charge.charged;
        }

        let outcome = BatchOutcome {
            partial_failure: !failed.is_empty(),
            batch_id,
            succeeded,
            failed,
            credits_used,
        };

        info!(
            batch_id = %outcome.batch_id,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            credits_used = outcome.credits_used,
            "Batch finished"
        );
        Ok(outcome)
    }

    /// Refuse the whole batch when the balance can't cover every item
    async fn admit_batch(&self, user_id: &str, cost: u32, items: usize) -> Result<()> {
        let required = cost.saturating_mul(u32::try_from(items).unwrap_or(u32::MAX));
        if required == 0 {
            return Ok(());
        }
        let balance = self.ledger.balance(user_id).await?;
        if balance.available < required {
            return Err(AppError::InsufficientCredits {
                required,
                available: balance.available,
            });
        }
        Ok(())
    }
}
