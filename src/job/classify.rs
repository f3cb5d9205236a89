//! Classification of vendor-reported failures
//!
//! Vendors only hand back free-form error strings. The string heuristics live
//! here; retry policy only ever looks at the resulting [`FailureClass`].

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    ContentPolicy,
    RateLimited,
    InvalidInput,
    Unknown,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::ContentPolicy => "content_policy",
            FailureClass::RateLimited => "rate_limited",
            FailureClass::InvalidInput => "invalid_input",
            FailureClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CONTENT_POLICY_KEYWORDS: &[&str] = &[
    "content policy",
    "content_policy",
    "nsfw",
    "safety checker",
    "safety filter",
    "safety system",
    "flagged",
    "moderation",
    "inappropriate",
    "sensitive content",
];

const RATE_LIMIT_KEYWORDS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "429",
    "throttl",
];

const INVALID_INPUT_KEYWORDS: &[&str] = &[
    "invalid",
    "validation",
    "unprocessable",
    "422",
    "must be",
    "unsupported",
    "required",
];

/// Classify a vendor error message. Content-policy matches win over the rest.
pub fn classify(message: &str) -> FailureClass {
    let lowered = message.to_lowercase();
    let matches_any = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));

    if matches_any(CONTENT_POLICY_KEYWORDS) {
        FailureClass::ContentPolicy
    } else if matches_any(RATE_LIMIT_KEYWORDS) {
        FailureClass::RateLimited
    } else if matches_any(INVALID_INPUT_KEYWORDS) {
        FailureClass::InvalidInput
    } else {
        FailureClass::Unknown
    }
}
