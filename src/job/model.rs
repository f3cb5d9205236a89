//! Job records, tool identifiers and batch correlation ids

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, Result};

/// Tool actions exposed by the toolkit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolId {
    Thumbnail,
    TalkingAvatar,
    VoiceOver,
    ScriptToVideo,
    YoutubeRepurpose,
    AffiliateScript,
    ImageGeneration,
    Transcription,
}

/// Kind of media a tool produces; drives the poll budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Text,
}

impl ToolId {
    pub const ALL: [ToolId; 8] = [
        ToolId::Thumbnail,
        ToolId::TalkingAvatar,
        ToolId::VoiceOver,
        ToolId::ScriptToVideo,
        ToolId::YoutubeRepurpose,
        ToolId::AffiliateScript,
        ToolId::ImageGeneration,
        ToolId::Transcription,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolId::Thumbnail => "thumbnail",
            ToolId::TalkingAvatar => "talking_avatar",
            ToolId::VoiceOver => "voice_over",
            ToolId::ScriptToVideo => "script_to_video",
            ToolId::YoutubeRepurpose => "youtube_repurpose",
            ToolId::AffiliateScript => "affiliate_script",
            ToolId::ImageGeneration => "image_generation",
            ToolId::Transcription => "transcription",
        }
    }

    pub fn media_kind(&self) -> MediaKind {
        match self {
            ToolId::Thumbnail | ToolId::ImageGeneration => MediaKind::Image,
            ToolId::TalkingAvatar | ToolId::ScriptToVideo | ToolId::YoutubeRepurpose => {
                MediaKind::Video
            }
            ToolId::VoiceOver => MediaKind::Audio,
            ToolId::AffiliateScript | ToolId::Transcription => MediaKind::Text,
        }
    }

    /// Tools whose vendor accepts a `safety_tolerance` parameter
    pub fn is_safety_aware(&self) -> bool {
        self.media_kind() == MediaKind::Image
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        ToolId::ALL
            .iter()
            .copied()
            .find(|tool| tool.as_str() == s)
            .ok_or_else(|| AppError::InvalidRequest(format!("Unknown tool '{}'", s)))
    }
}

/// Third-party services jobs are submitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VendorId {
    Replicate,
    AssemblyAi,
}

impl VendorId {
    pub fn as_str(&self) -> &'static str {
        match self {
            VendorId::Replicate => "replicate",
            VendorId::AssemblyAi => "assemblyai",
        }
    }
}

impl fmt::Display for VendorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a job record
///
/// `starting -> processing -> {succeeded | failed | canceled}`. `timed_out`
/// is written locally when the poll budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Starting => "starting",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled | JobStatus::TimedOut
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation token grouping the jobs of one user action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Time-seeded random id, e.g. `lq3k9z1c-a8Xk2P`
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        Self(format!("{}-{}", to_base36(millis), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BatchId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// One invocation of a vendor AI call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub user_id: String,
    pub tool: ToolId,
    pub vendor: VendorId,
    pub model_version: String,
    pub status: JobStatus,
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub batch_id: Option<BatchId>,
    #[serde(default)]
    pub segment: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Record for a job the vendor has just accepted
    pub fn submitted(
        job_id: impl Into<String>,
        user_id: impl Into<String>,
        tool: ToolId,
        vendor: VendorId,
        model_version: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            tool,
            vendor,
            model_version: model_version.into(),
            status: JobStatus::Starting,
            input,
            output: None,
            error: None,
            batch_id: None,
            segment: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_batch(mut self, batch_id: Option<BatchId>, segment: Option<String>) -> Self {
        self.batch_id = batch_id;
        self.segment = segment;
        self
    }

    /// Apply a lifecycle change. Terminal records are immutable.
    pub fn transition(
        &mut self,
        status: JobStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        if self.status.is_terminal() {
            return Err(AppError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.status,
                to: status,
            });
        }

        let now = Utc::now();
        if status != JobStatus::Starting && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
        if status == JobStatus::Succeeded {
            self.output = output;
        }
        if error.is_some() {
            self.error = error;
        }
        self.status = status;
        Ok(())
    }
}
