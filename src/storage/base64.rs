//! Base64 payloads and `data:` URLs returned inline by some vendors

use base64::{engine::general_purpose::STANDARD, Engine};
use crate::error::{AppError, Result};

/// Decode base64, accepting both bare payloads and `data:...;base64,` URLs
pub fn decode(encoded: &str) -> Result<Vec<u8>> {
    let data = match encoded.split_once(',') {
        Some((_, payload)) => payload,
        None => encoded,
    };

    STANDARD
        .decode(data.trim())
        .map_err(|e| AppError::InvalidRequest(format!("Invalid base64 data: {}", e)))
}

pub fn is_data_url(value: &str) -> bool {
    value.starts_with("data:")
}

/// MIME type declared by a data URL, e.g. `image/png` or `audio/mpeg`
pub fn media_type_from_data_url(data_url: &str) -> Option<&str> {
    let rest = data_url.strip_prefix("data:")?;
    let end = rest.find([';', ','])?;
    let media_type = &rest[..end];
    (!media_type.is_empty()).then_some(media_type)
}
