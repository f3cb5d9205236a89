//! Application settings and configuration management

use crate::error::{AppError, Result};
use crate::job::model::{MediaKind, ToolId};
use crate::job::poller::PollConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub vendors: VendorsConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub supabase: SupabaseConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on one HTTP request, including polling
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    900
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

/// An API key and the user it authenticates as
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiKeyConfig {
    pub key: String,
    pub user_id: String,
}

fn default_true() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_keys: vec![],
        }
    }
}

/// Vendor API credentials and endpoints
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct VendorsConfig {
    #[serde(default)]
    pub replicate: ReplicateConfig,
    #[serde(default)]
    pub assemblyai: AssemblyAiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicateConfig {
    #[serde(default = "default_replicate_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_vendor_timeout")]
    pub timeout_ms: u64,
}

fn default_replicate_url() -> String {
    "https://api.replicate.com".to_string()
}

fn default_vendor_timeout() -> u64 {
    30000
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        Self {
            base_url: default_replicate_url(),
            api_token: String::new(),
            timeout_ms: default_vendor_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssemblyAiConfig {
    #[serde(default = "default_assemblyai_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_vendor_timeout")]
    pub timeout_ms: u64,
}

fn default_assemblyai_url() -> String {
    "https://api.assemblyai.com".to_string()
}

impl Default for AssemblyAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_assemblyai_url(),
            api_key: String::new(),
            timeout_ms: default_vendor_timeout(),
        }
    }
}

/// Poll interval and per-media wall-clock budgets
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_image_wait")]
    pub image_max_wait_ms: u64,
    #[serde(default = "default_video_wait")]
    pub video_max_wait_ms: u64,
    #[serde(default = "default_audio_wait")]
    pub audio_max_wait_ms: u64,
    #[serde(default = "default_audio_wait")]
    pub text_max_wait_ms: u64,
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_image_wait() -> u64 {
    300_000
}

fn default_video_wait() -> u64 {
    600_000
}

fn default_audio_wait() -> u64 {
    180_000
}

impl PollingConfig {
    pub fn poll_config(&self, kind: MediaKind) -> PollConfig {
        let max_wait_ms = match kind {
            MediaKind::Image => self.image_max_wait_ms,
            MediaKind::Video => self.video_max_wait_ms,
            MediaKind::Audio => self.audio_max_wait_ms,
            MediaKind::Text => self.text_max_wait_ms,
        };
        PollConfig {
            interval: Duration::from_millis(self.interval_ms),
            max_wait: Duration::from_millis(max_wait_ms),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            image_max_wait_ms: default_image_wait(),
            video_max_wait_ms: default_video_wait(),
            audio_max_wait_ms: default_audio_wait(),
            text_max_wait_ms: default_audio_wait(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// `local` or `supabase`
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default = "default_storage_path")]
    pub base_path: String,
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_temp_bucket")]
    pub temp_bucket: String,
    #[serde(default = "default_temp_max_age")]
    pub temp_max_age_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_vendor_timeout")]
    pub fetch_timeout_ms: u64,
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_storage_path() -> String {
    "./storage".to_string()
}

fn default_url_prefix() -> String {
    "http://localhost:8080/storage".to_string()
}

fn default_bucket() -> String {
    "generated-assets".to_string()
}

fn default_temp_bucket() -> String {
    "temp-videos".to_string()
}

fn default_temp_max_age() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    60 * 60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            base_path: default_storage_path(),
            url_prefix: default_url_prefix(),
            bucket: default_bucket(),
            temp_bucket: default_temp_bucket(),
            temp_max_age_secs: default_temp_max_age(),
            sweep_interval_secs: default_sweep_interval(),
            fetch_timeout_ms: default_vendor_timeout(),
        }
    }
}

/// Managed backend (PostgREST + storage). Empty `url` keeps everything in memory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub service_key: String,
    #[serde(default = "default_jobs_table")]
    pub jobs_table: String,
    #[serde(default = "default_credits_table")]
    pub credits_table: String,
    #[serde(default = "default_deduct_function")]
    pub deduct_function: String,
    #[serde(default = "default_vendor_timeout")]
    pub timeout_ms: u64,
}

fn default_jobs_table() -> String {
    "ai_jobs".to_string()
}

fn default_credits_table() -> String {
    "user_credits".to_string()
}

fn default_deduct_function() -> String {
    "deduct_credits".to_string()
}

impl SupabaseConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }
}

impl Default for SupabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            service_key: String::new(),
            jobs_table: default_jobs_table(),
            credits_table: default_credits_table(),
            deduct_function: default_deduct_function(),
            timeout_ms: default_vendor_timeout(),
        }
    }
}

/// Credit allowance and per-tool prices
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreditsConfig {
    #[serde(default = "default_allowance")]
    pub monthly_allowance: u32,
    #[serde(default = "default_costs")]
    pub costs: HashMap<String, u32>,
}

fn default_allowance() -> u32 {
    100
}

fn default_costs() -> HashMap<String, u32> {
    [
        (ToolId::Thumbnail, 1),
        (ToolId::ImageGeneration, 1),
        (ToolId::TalkingAvatar, 10),
        (ToolId::VoiceOver, 2),
        (ToolId::ScriptToVideo, 8),
        (ToolId::YoutubeRepurpose, 5),
        (ToolId::AffiliateScript, 1),
        (ToolId::Transcription, 2),
    ]
    .into_iter()
    .map(|(tool, cost)| (tool.as_str().to_string(), cost))
    .collect()
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            monthly_allowance: default_allowance(),
            costs: default_costs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `json` or `pretty`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn invalid(message: impl Into<String>) -> AppError {
    AppError::Config(config::ConfigError::Message(message.into()))
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/default.toml")
    }

    /// Load settings from a specific configuration file path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("auth.enabled", true)?
            .add_source(File::with_name(path.as_ref().to_str().unwrap_or("config/default")).required(false))
            // Override with environment variables (prefixed with TOOLKIT__)
            .add_source(
                Environment::with_prefix("TOOLKIT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(invalid("Server port cannot be 0"));
        }

        let longest_wait_ms = [
            self.polling.image_max_wait_ms,
            self.polling.video_max_wait_ms,
            self.polling.audio_max_wait_ms,
            self.polling.text_max_wait_ms,
        ]
        .into_iter()
        .max()
        .unwrap_or_default();
        if self.server.request_timeout_secs.saturating_mul(1000) <= longest_wait_ms {
            return Err(invalid(
                "server.request_timeout_secs must exceed the longest poll budget",
            ));
        }

        if self.polling.interval_ms == 0 {
            return Err(invalid("Poll interval cannot be 0"));
        }

        for key in &self.auth.api_keys {
            if key.key.is_empty() || key.user_id.is_empty() {
                return Err(invalid("API keys need both a key and a user_id"));
            }
        }

        if self.vendors.replicate.api_token.is_empty() && self.vendors.assemblyai.api_key.is_empty() {
            return Err(invalid(
                "At least one vendor must be configured (replicate.api_token or assemblyai.api_key)",
            ));
        }

        if self.storage.sweep_interval_secs == 0 {
            return Err(invalid("storage.sweep_interval_secs cannot be 0"));
        }

        match self.storage.backend.as_str() {
            "local" => {}
            "supabase" if self.supabase.is_configured() => {}
            "supabase" => {
                return Err(invalid("Storage backend 'supabase' requires supabase.url"));
            }
            other => {
                return Err(invalid(format!(
                    "Unknown storage backend '{}'. Must be 'local' or 'supabase'",
                    other
                )));
            }
        }

        if self.supabase.is_configured() && self.supabase.service_key.is_empty() {
            return Err(invalid("supabase.service_key is required when supabase.url is set"));
        }

        for tool in self.credits.costs.keys() {
            tool.parse::<ToolId>()
                .map_err(|_| invalid(format!("Unknown tool '{}' in credits.costs", tool)))?;
        }

        Ok(())
    }
}
