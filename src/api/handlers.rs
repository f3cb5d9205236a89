//! Request handlers. Tool actions run on their own task and reach a
//! terminal history row even if the client goes away.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::api::ApiResponse;
use crate::credits::CreditBalance;
use crate::error::{AppError, Result};
use crate::job::model::{JobRecord, JobStatus, ToolId, VendorId};
use crate::middleware::auth::AuthenticatedUser;
use crate::pipeline::{BatchItem, BatchOutcome, BatchRequest, JoinPolicy, ToolOutcome, ToolRequest};
use crate::AppState;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct CreateJobBody {
    pub model_version: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct CreateBatchBody {
    pub model_version: String,
    pub items: Vec<BatchItem>,
    #[serde(default)]
    pub join: JoinPolicy,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CancelResult {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub vendors: Vec<VendorId>,
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::InvalidRequest(rejection.body_text()))
}

/// Run pipeline work detached from the request future
async fn detached<T, F>(work: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| AppError::Internal(format!("Pipeline task failed: {}", e)))?
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        vendors: state.pipeline.vendors().configured(),
    })
}

/// `POST /v1/tools/:tool/jobs`
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(tool): Path<String>,
    payload: std::result::Result<Json<CreateJobBody>, JsonRejection>,
) -> Result<Json<ApiResponse<ToolOutcome>>> {
    let tool: ToolId = tool.parse()?;
    let payload = body(payload)?;

    info!(user_id = %user.user_id, tool = %tool, "Tool job requested");
    let request = ToolRequest::new(user.user_id, tool, payload.model_version, payload.input);
    let pipeline = state.pipeline.clone();
    let outcome = detached(async move { pipeline.invoke(request).await }).await?;
    Ok(Json(ApiResponse::ok(outcome)))
}

/// `POST /v1/tools/:tool/batches`
pub async fn create_batch(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(tool): Path<String>,
    payload: std::result::Result<Json<CreateBatchBody>, JsonRejection>,
) -> Result<Json<ApiResponse<BatchOutcome>>> {
    let tool: ToolId = tool.parse()?;
    let payload = body(payload)?;

    let request = BatchRequest {
        user_id: user.user_id,
        tool,
        model_version: payload.model_version,
        items: payload.items,
        join: payload.join,
    };
    let pipeline = state.pipeline.clone();
    let outcome = detached(async move { pipeline.run_batch(request).await }).await?;
    Ok(Json(ApiResponse::ok(outcome)))
}

/// `GET /v1/jobs`
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<ApiResponse<Vec<JobRecord>>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let jobs = state
        .pipeline
        .repository()
        .list_for_user(&user.user_id, limit)
        .await?;
    Ok(Json(ApiResponse::ok(jobs)))
}

/// `GET /v1/jobs/:id`
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(job_id): Path<String>,
) -> Result<Json<ApiResponse<JobRecord>>> {
    let record = state
        .pipeline
        .repository()
        .get(&job_id)
        .await?
        .filter(|record| record.user_id == user.user_id)
        .ok_or_else(|| AppError::NotFound(format!("Job {}", job_id)))?;
    Ok(Json(ApiResponse::ok(record)))
}

/// `POST /v1/jobs/:id/cancel`
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(job_id): Path<String>,
) -> Result<Json<ApiResponse<CancelResult>>> {
    let status = state.pipeline.cancel(&user.user_id, &job_id).await?;
    Ok(Json(ApiResponse::ok(CancelResult { job_id, status })))
}

/// `GET /v1/credits`
pub async fn get_credits(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<ApiResponse<CreditBalance>>> {
    let balance = state.pipeline.ledger().balance(&user.user_id).await?;
    Ok(Json(ApiResponse::ok(balance)))
}
