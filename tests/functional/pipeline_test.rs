//! Functional tests for the tool pipeline: scripted vendor, mocked asset
//! host, local storage and in-memory ledger and history

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use toolkit_gateway::{
    config::PollingConfig,
    credits::{CreditBalance, CreditLedger, CreditPricing, DeductOutcome, InMemoryLedger},
    job::classify::FailureClass,
    job::model::{JobStatus, ToolId, VendorId},
    persistence::{InMemoryJobRepository, JobRepository},
    pipeline::{BatchItem, BatchRequest, JobPipeline, JoinPolicy, ToolRequest},
    storage::{AssetRelocator, LocalObjectStore},
    vendor::{
        JobDescriptor, JobOutput, JobSnapshot, SubmitRequest, VendorClient, VendorRegistry,
        VendorStatus,
    },
    AppError, Result,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];
const USER: &str = "user-1";
const URL_PREFIX: &str = "http://localhost:8080/storage";

/// How a scripted job behaves once submitted
#[derive(Clone)]
enum Script {
    Succeed(JobOutput),
    Fail(&'static str),
    Hang,
    RejectSubmit,
}

/// Vendor double: each submission takes the next queued script (or the
/// default), reports `processing` once, then its terminal state
struct ScriptedVendor {
    vendor: VendorId,
    queue: Mutex<VecDeque<Script>>,
    default: Script,
    jobs: Mutex<HashMap<String, (Script, u32)>>,
    submissions: Mutex<Vec<SubmitRequest>>,
    counter: AtomicU32,
}

impl ScriptedVendor {
    fn new(vendor: VendorId, default: Script) -> Self {
        Self {
            vendor,
            queue: Mutex::new(VecDeque::new()),
            default,
            jobs: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            counter: AtomicU32::new(0),
        }
    }

    fn then(self, script: Script) -> Self {
        self.queue.lock().push_back(script);
        self
    }

    fn submissions(&self) -> Vec<SubmitRequest> {
        self.submissions.lock().clone()
    }
}

#[async_trait]
impl VendorClient for ScriptedVendor {
    fn vendor(&self) -> VendorId {
        self.vendor
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<JobDescriptor> {
        self.submissions.lock().push(request.clone());
        let script = self
            .queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        if let Script::RejectSubmit = script {
            return Err(AppError::VendorSubmission {
                vendor: self.vendor,
                status: 422,
                body: "{\"detail\":\"Invalid version\"}".to_string(),
            });
        }

        let id = format!("job-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.jobs.lock().insert(id.clone(), (script, 0));
        Ok(JobDescriptor {
            id,
            status: VendorStatus::Starting,
            created_at: None,
        })
    }

    async fn fetch(&self, job_id: &str) -> Result<JobSnapshot> {
        let (script, polls) = {
            let mut jobs = self.jobs.lock();
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| AppError::NotFound(job_id.to_string()))?;
            entry.1 += 1;
            (entry.0.clone(), entry.1)
        };

        let (status, output, error) = match (script, polls) {
            (Script::Hang, _) | (_, 1) => (VendorStatus::Processing, None, None),
            (Script::Succeed(output), _) => (VendorStatus::Succeeded, Some(output), None),
            (Script::Fail(message), _) => (VendorStatus::Failed, None, Some(message.to_string())),
            (Script::RejectSubmit, _) => (VendorStatus::Failed, None, None),
        };

        Ok(JobSnapshot {
            id: job_id.to_string(),
            status,
            output,
            error,
        })
    }

    async fn cancel(&self, job_id: &str) -> Result<JobSnapshot> {
        Ok(JobSnapshot {
            id: job_id.to_string(),
            status: VendorStatus::Canceled,
            output: None,
            error: None,
        })
    }
}

/// Ledger whose deductions always error
struct BrokenDeductLedger(Arc<InMemoryLedger>);

#[async_trait]
impl CreditLedger for BrokenDeductLedger {
    async fn balance(&self, user_id: &str) -> Result<CreditBalance> {
        self.0.balance(user_id).await
    }

    async fn deduct(&self, _user_id: &str, _amount: u32) -> Result<DeductOutcome> {
        Err(AppError::Persistence("credits database unavailable".to_string()))
    }
}

/// Ledger that yields before every call so concurrent callers interleave
struct YieldingLedger(Arc<InMemoryLedger>);

#[async_trait]
impl CreditLedger for YieldingLedger {
    async fn balance(&self, user_id: &str) -> Result<CreditBalance> {
        tokio::task::yield_now().await;
        self.0.balance(user_id).await
    }

    async fn deduct(&self, user_id: &str, amount: u32) -> Result<DeductOutcome> {
        tokio::task::yield_now().await;
        self.0.deduct(user_id, amount).await
    }
}

type WrapLedger = fn(Arc<InMemoryLedger>) -> Arc<dyn CreditLedger>;

struct Harness {
    _dir: TempDir,
    _assets: MockServer,
    vendor: Arc<ScriptedVendor>,
    ledger: Arc<InMemoryLedger>,
    repository: Arc<InMemoryJobRepository>,
    store: Arc<LocalObjectStore>,
    pipeline: JobPipeline,
}

impl Harness {
    /// `build` receives the URL of a vendor-hosted PNG
    async fn new(build: impl FnOnce(String) -> ScriptedVendor) -> Self {
        Self::with_ledger(build, |ledger| -> Arc<dyn CreditLedger> { ledger }).await
    }

    async fn with_broken_deductions(build: impl FnOnce(String) -> ScriptedVendor) -> Self {
        Self::with_ledger(build, |ledger| -> Arc<dyn CreditLedger> {
            Arc::new(BrokenDeductLedger(ledger))
        })
        .await
    }

    async fn with_ledger(build: impl FnOnce(String) -> ScriptedVendor, wrap: WrapLedger) -> Self {
        let assets = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/out/thumb.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(PNG),
            )
            .mount(&assets)
            .await;
        Mock::given(method("GET"))
            .and(path("/out/expired.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&assets)
            .await;

        let vendor = Arc::new(build(format!("{}/out/thumb.png", assets.uri())));
        let registry = Arc::new(VendorRegistry::new());
        registry.register(vendor.clone());

        let ledger = Arc::new(InMemoryLedger::new(0));
        ledger.grant(USER, 10);
        let pipeline_ledger = wrap(ledger.clone());

        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path(), URL_PREFIX));
        let relocator = Arc::new(
            AssetRelocator::new(store.clone(), "generated-assets", Duration::from_secs(5)).unwrap(),
        );

        let repository = Arc::new(InMemoryJobRepository::new());
        let pipeline = JobPipeline::new(
            registry,
            pipeline_ledger,
            repository.clone(),
            relocator,
            CreditPricing::default(),
            PollingConfig {
                interval_ms: 10,
                image_max_wait_ms: 300,
                video_max_wait_ms: 300,
                audio_max_wait_ms: 300,
                text_max_wait_ms: 300,
            },
        );

        Self {
            _dir: dir,
            _assets: assets,
            vendor,
            ledger,
            repository,
            store,
            pipeline,
        }
    }

    async fn available(&self) -> u32 {
        self.ledger.balance(USER).await.unwrap().available
    }
}

fn succeed(url: String) -> Script {
    Script::Succeed(JobOutput::Urls(vec![url]))
}

fn thumbnail(prompt: &str) -> ToolRequest {
    ToolRequest::new(
        USER,
        ToolId::Thumbnail,
        "flux-schnell",
        json!({ "prompt": prompt, "safety_tolerance": 4 }),
    )
}

#[tokio::test]
async fn test_immediate_success_relocates_and_records() {
    let harness = Harness::new(|url| ScriptedVendor::new(VendorId::Replicate, succeed(url))).await;

    let outcome = harness.pipeline.invoke(thumbnail("a red car")).await.unwrap();

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.credits_charged, 1);
    assert!(!outcome.credit_shortfall);
    assert!(outcome.history_recorded);
    assert_eq!(outcome.assets.len(), 1);

    let asset = &outcome.assets[0];
    let expected_path = format!(
        "user-1/thumbnail/{}/{}.png",
        outcome.batch_id, outcome.job_id
    );
    assert_eq!(asset.path, expected_path);
    assert_eq!(
        asset.url,
        format!("{}/generated-assets/{}", URL_PREFIX, expected_path)
    );
    assert_eq!(
        harness.store.read("generated-assets", &asset.path).await.unwrap(),
        PNG
    );

    let row = harness.repository.get(&outcome.job_id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Succeeded);
    assert_eq!(row.output.as_ref().unwrap()["assets"][0], asset.url.as_str());
    assert!(row.started_at.is_some());
    assert!(row.completed_at.is_some());

    assert_eq!(harness.available().await, 9);
}

#[tokio::test]
async fn test_content_policy_rejection_retries_with_sanitized_prompt() {
    let harness = Harness::new(|url| {
        ScriptedVendor::new(VendorId::Replicate, succeed(url))
            .then(Script::Fail("NSFW content detected. Try a different prompt."))
    })
    .await;

    let outcome = harness
        .pipeline
        .invoke(thumbnail("warrior holding a bloody knife"))
        .await
        .unwrap();

    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.input["prompt"], "warrior holding a dramatic tool");
    assert_eq!(outcome.input["safety_tolerance"], 6);

    let submissions = harness.vendor.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].input["safety_tolerance"], 4);
    assert_eq!(submissions[1].input["prompt"], "warrior holding a dramatic tool");
    assert_eq!(submissions[1].input["safety_tolerance"], 6);

    // Charged once for the whole invocation
    assert_eq!(outcome.credits_charged, 1);
    assert_eq!(harness.available().await, 9);

    let first = harness.repository.get("job-0").await.unwrap().unwrap();
    assert_eq!(first.status, JobStatus::Failed);
    let second = harness.repository.get("job-1").await.unwrap().unwrap();
    assert_eq!(second.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn test_content_policy_retry_happens_once() {
    let harness = Harness::new(|_| {
        ScriptedVendor::new(VendorId::Replicate, Script::Fail("flagged by safety checker"))
    })
    .await;

    let result = harness.pipeline.invoke(thumbnail("a gun")).await;

    assert!(matches!(
        result,
        Err(AppError::VendorFailure {
            class: FailureClass::ContentPolicy,
            status: JobStatus::Failed,
            ..
        })
    ));
    assert_eq!(harness.vendor.submissions().len(), 2);
    assert_eq!(harness.available().await, 9);
}

#[tokio::test]
async fn test_non_image_tools_do_not_retry() {
    let harness = Harness::new(|_| {
        ScriptedVendor::new(VendorId::Replicate, Script::Fail("Rate limit exceeded"))
    })
    .await;

    let request = ToolRequest::new(
        USER,
        ToolId::VoiceOver,
        "xtts-v2",
        json!({ "text": "Welcome back" }),
    );
    let result = harness.pipeline.invoke(request).await;

    match result {
        Err(e @ AppError::VendorFailure { .. }) => assert_eq!(e.code(), "rate_limited"),
        other => panic!("expected vendor failure, got {:?}", other.map(|o| o.job_id)),
    }
    assert_eq!(harness.vendor.submissions().len(), 1);
}

#[tokio::test]
async fn test_timeout_is_distinct_and_charges_once() {
    let harness = Harness::new(|_| ScriptedVendor::new(VendorId::Replicate, Script::Hang)).await;

    let result = harness.pipeline.invoke(thumbnail("a red car")).await;

    assert!(matches!(result, Err(AppError::PollTimeout { .. })));
    let row = harness.repository.get("job-0").await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::TimedOut);
    assert!(row.output.is_none());
    assert_eq!(harness.vendor.submissions().len(), 1);
    assert_eq!(harness.available().await, 9);
}

#[tokio::test]
async fn test_submission_failure_spends_and_records_nothing() {
    let harness =
        Harness::new(|_| ScriptedVendor::new(VendorId::Replicate, Script::RejectSubmit)).await;

    let result = harness.pipeline.invoke(thumbnail("a red car")).await;

    match result {
        Err(AppError::VendorSubmission { status, body, .. }) => {
            assert_eq!(status, 422);
            assert!(body.contains("Invalid version"));
        }
        other => panic!("expected submission error, got {:?}", other.map(|o| o.job_id)),
    }
    assert!(harness.repository.is_empty());
    assert_eq!(harness.available().await, 10);
}

#[tokio::test]
async fn test_insufficient_credits_blocks_submission() {
    let harness = Harness::new(|url| ScriptedVendor::new(VendorId::Replicate, succeed(url))).await;
    harness.ledger.grant(USER, 0);

    let result = harness.pipeline.invoke(thumbnail("a red car")).await;

    assert!(matches!(
        result,
        Err(AppError::InsufficientCredits {
            required: 1,
            available: 0
        })
    ));
    assert!(harness.vendor.submissions().is_empty());
}

#[tokio::test]
async fn test_invalid_prompt_is_rejected_before_submission() {
    let harness = Harness::new(|url| ScriptedVendor::new(VendorId::Replicate, succeed(url))).await;

    let result = harness.pipeline.invoke(thumbnail("  ")).await;

    assert!(matches!(result, Err(AppError::InvalidRequest(_))));
    assert!(harness.vendor.submissions().is_empty());
    assert_eq!(harness.available().await, 10);
}

#[tokio::test]
async fn test_failed_deduction_still_returns_result() {
    let harness = Harness::with_broken_deductions(|url| {
        ScriptedVendor::new(VendorId::Replicate, succeed(url))
    })
    .await;

    let outcome = harness.pipeline.invoke(thumbnail("a red car")).await.unwrap();

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert!(outcome.credit_shortfall);
    assert_eq!(outcome.credits_charged, 0);
    assert_eq!(harness.available().await, 10);
}

#[tokio::test]
async fn test_relocation_failure_marks_job_failed() {
    let harness = Harness::new(|url| {
        let expired = url.replace("thumb.png", "expired.png");
        ScriptedVendor::new(VendorId::Replicate, succeed(expired))
    })
    .await;

    let result = harness.pipeline.invoke(thumbnail("a red car")).await;

    assert!(matches!(result, Err(AppError::Relocation { .. })));
    let row = harness.repository.get("job-0").await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Failed);
    assert!(row.error.unwrap().contains("404"));
}

#[tokio::test]
async fn test_text_output_is_returned_without_relocation() {
    let harness = Harness::new(|_| {
        ScriptedVendor::new(
            VendorId::Replicate,
            Script::Succeed(JobOutput::Text("Hook: this blender changed my mornings".into())),
        )
    })
    .await;

    let request = ToolRequest::new(
        USER,
        ToolId::AffiliateScript,
        "llama-3-70b",
        json!({ "product": "blender" }),
    );
    let outcome = harness.pipeline.invoke(request).await.unwrap();

    assert!(outcome.assets.is_empty());
    assert_eq!(
        outcome.text.as_deref(),
        Some("Hook: this blender changed my mornings")
    );
    let row = harness.repository.get(&outcome.job_id).await.unwrap().unwrap();
    assert_eq!(row.output.unwrap()["text"], "Hook: this blender changed my mornings");
}

fn batch_items(prompts: &[&str]) -> Vec<BatchItem> {
    prompts
        .iter()
        .enumerate()
        .map(|(i, prompt)| BatchItem {
            segment: format!("scene_{}", i + 1),
            input: json!({ "prompt": prompt }),
        })
        .collect()
}

#[tokio::test]
async fn test_partial_batch_reports_failures_next_to_successes() {
    let harness = Harness::new(|url| ScriptedVendor::new(VendorId::Replicate, succeed(url))).await;

    let outcome = harness
        .pipeline
        .run_batch(BatchRequest {
            user_id: USER.to_string(),
            tool: ToolId::ImageGeneration,
            model_version: "flux-schnell".to_string(),
            items: batch_items(&["intro shot", "product close-up", "", "b-roll", "outro"]),
            join: JoinPolicy::PartialSuccess,
        })
        .await
        .unwrap();

    assert_eq!(outcome.succeeded.len(), 4);
    assert_eq!(outcome.failed.len(), 1);
    assert!(outcome.partial_failure);
    assert_eq!(outcome.credits_used, 4);
    assert_eq!(harness.available().await, 6);

    let failed = &outcome.failed[0];
    assert_eq!(failed.segment, "scene_3");
    assert_eq!(failed.prompt.as_deref(), Some(""));
    assert_eq!(failed.code, "invalid_request");

    for result in &outcome.succeeded {
        assert_eq!(result.outcome.batch_id, outcome.batch_id);
        assert_eq!(
            result.outcome.assets[0].path,
            format!(
                "user-1/image_generation/{}/{}.png",
                outcome.batch_id, result.segment
            )
        );
    }

    let rows = harness.repository.list_batch(&outcome.batch_id).await.unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.status == JobStatus::Succeeded));
}

#[tokio::test]
async fn test_all_or_nothing_batch_fails_on_any_item() {
    let harness = Harness::new(|url| ScriptedVendor::new(VendorId::Replicate, succeed(url))).await;

    let result = harness
        .pipeline
        .run_batch(BatchRequest {
            user_id: USER.to_string(),
            tool: ToolId::ImageGeneration,
            model_version: "flux-schnell".to_string(),
            items: batch_items(&["intro shot", ""]),
            join: JoinPolicy::AllOrNothing,
        })
        .await;

    assert!(matches!(result, Err(AppError::InvalidRequest(_))));
    assert!(harness.vendor.submissions().is_empty());
    assert_eq!(harness.available().await, 10);
}

#[tokio::test]
async fn test_all_or_nothing_failure_settles_every_sibling() {
    let harness = Harness::new(|url| {
        ScriptedVendor::new(VendorId::Replicate, succeed(url))
            .then(Script::Fail("CUDA out of memory"))
    })
    .await;

    let result = harness
        .pipeline
        .run_batch(BatchRequest {
            user_id: USER.to_string(),
            tool: ToolId::ImageGeneration,
            model_version: "flux-schnell".to_string(),
            items: batch_items(&["intro shot", "b-roll", "outro"]),
            join: JoinPolicy::AllOrNothing,
        })
        .await;

    assert!(matches!(
        result,
        Err(AppError::VendorFailure {
            class: FailureClass::Unknown,
            ..
        })
    ));
    assert_eq!(harness.vendor.submissions().len(), 3);
    assert_eq!(harness.available().await, 10);

    // No sibling is left starting or processing
    let rows = harness.repository.list_for_user(USER, 10).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.status.is_terminal()));
    assert_eq!(
        rows.iter().filter(|r| r.status == JobStatus::Succeeded).count(),
        2
    );
    assert_eq!(
        rows.iter().filter(|r| r.status == JobStatus::Failed).count(),
        1
    );
}

#[tokio::test]
async fn test_batch_is_admitted_against_total_cost() {
    let harness = Harness::with_ledger(
        |url| ScriptedVendor::new(VendorId::Replicate, succeed(url)),
        |ledger| -> Arc<dyn CreditLedger> { Arc::new(YieldingLedger(ledger)) },
    )
    .await;
    harness.ledger.grant(USER, 2);

    let request = BatchRequest {
        user_id: USER.to_string(),
        tool: ToolId::ImageGeneration,
        model_version: "flux-schnell".to_string(),
        items: batch_items(&["one", "two", "three", "four", "five"]),
        join: JoinPolicy::PartialSuccess,
    };

    let result = harness.pipeline.run_batch(request.clone()).await;
    assert!(matches!(
        result,
        Err(AppError::InsufficientCredits {
            required: 5,
            available: 2
        })
    ));
    assert!(harness.vendor.submissions().is_empty());
    assert_eq!(harness.available().await, 2);

    harness.ledger.grant(USER, 5);
    let outcome = harness.pipeline.run_batch(request).await.unwrap();
    assert_eq!(outcome.succeeded.len(), 5);
    assert_eq!(outcome.credits_used, 5);
    assert!(outcome.succeeded.iter().all(|s| !s.outcome.credit_shortfall));
    assert_eq!(harness.available().await, 0);
}

#[tokio::test]
async fn test_batch_bills_only_segments_that_succeed() {
    let harness = Harness::new(|url| {
        let ok = succeed(url);
        ScriptedVendor::new(VendorId::Replicate, ok.clone())
            .then(ok.clone())
            .then(ok.clone())
            .then(ok)
            .then(Script::Fail("CUDA out of memory"))
    })
    .await;

    let outcome = harness
        .pipeline
        .run_batch(BatchRequest {
            user_id: USER.to_string(),
            tool: ToolId::VoiceOver,
            model_version: "xtts-v2".to_string(),
            items: batch_items(&["hook", "problem", "product", "proof", "cta"]),
            join: JoinPolicy::PartialSuccess,
        })
        .await
        .unwrap();

    assert_eq!(outcome.succeeded.len(), 4);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].code, "unknown");
    assert_eq!(outcome.credits_used, 8);
    assert_eq!(10 - harness.available().await, outcome.credits_used);
    assert!(outcome
        .succeeded
        .iter()
        .all(|s| s.outcome.credits_charged == 2));

    let rows = harness.repository.list_batch(&outcome.batch_id).await.unwrap();
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|r| r.status.is_terminal()));
}

#[tokio::test]
async fn test_batch_where_every_item_fails() {
    let harness =
        Harness::new(|_| ScriptedVendor::new(VendorId::Replicate, Script::RejectSubmit)).await;

    let result = harness
        .pipeline
        .run_batch(BatchRequest {
            user_id: USER.to_string(),
            tool: ToolId::ImageGeneration,
            model_version: "flux-schnell".to_string(),
            items: batch_items(&["one", "two"]),
            join: JoinPolicy::PartialSuccess,
        })
        .await;

    assert!(matches!(result, Err(AppError::BatchFailed { failed: 2, .. })));
    assert_eq!(harness.available().await, 10);
}

#[tokio::test]
async fn test_cancel_rules() {
    let harness = Harness::new(|url| {
        ScriptedVendor::new(VendorId::Replicate, succeed(url)).then(Script::Hang)
    })
    .await;

    // job-0 hangs and is left timed_out
    assert!(harness.pipeline.invoke(thumbnail("slow")).await.is_err());
    // job-1 succeeds
    let done = harness.pipeline.invoke(thumbnail("fast")).await.unwrap();

    assert_eq!(
        harness.pipeline.cancel(USER, "job-0").await.unwrap(),
        JobStatus::Canceled
    );
    assert!(matches!(
        harness.pipeline.cancel(USER, &done.job_id).await,
        Err(AppError::InvalidRequest(_))
    ));
    assert!(matches!(
        harness.pipeline.cancel("someone-else", "job-0").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        harness.pipeline.cancel(USER, "missing").await,
        Err(AppError::NotFound(_))
    ));
}
