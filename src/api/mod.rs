//! HTTP surface

pub mod handlers;
pub mod routes;

use serde::Serialize;

/// Success envelope; errors use [`crate::error::ErrorResponse`]
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}
