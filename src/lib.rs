//! Creator Toolkit Gateway
//!
//! Runs creator AI tools against third-party vendors: submits the job,
//! polls it to completion, relocates the generated assets into application
//! storage, bills credits and records job history.

pub mod api;
pub mod config;
pub mod credits;
pub mod error;
pub mod job;
pub mod middleware;
pub mod persistence;
pub mod pipeline;
pub mod storage;
pub mod vendor;

pub use error::{AppError, Result};

use std::sync::Arc;

use pipeline::JobPipeline;

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Arc<config::Settings>,
    pub pipeline: Arc<JobPipeline>,
}
