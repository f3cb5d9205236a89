//! Configuration loading

pub mod settings;

pub use settings::{
    ApiKeyConfig, AssemblyAiConfig, AuthConfig, CreditsConfig, LoggingConfig, PollingConfig,
    ReplicateConfig, ServerConfig, Settings, StorageConfig, SupabaseConfig, VendorsConfig,
};
