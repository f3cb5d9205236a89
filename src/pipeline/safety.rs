//! Content-safety retry: prompt sanitising and relaxed tolerance

use serde_json::Value;

/// How a content-policy rejection is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyRetryPolicy {
    /// Additional attempts after the first
    pub max_retries: u32,
    /// `safety_tolerance` sent on the retry
    pub relaxed_tolerance: u8,
}

impl Default for SafetyRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            relaxed_tolerance: 6,
        }
    }
}

impl SafetyRetryPolicy {
    /// Copy of `input` with a sanitised prompt and the relaxed tolerance
    pub fn relax_input(&self, input: &Value) -> Value {
        let mut relaxed = input.clone();
        if let Value::Object(map) = &mut relaxed {
            if let Some(Value::String(prompt)) = map.get("prompt") {
                let sanitized = sanitize_prompt(prompt);
                map.insert("prompt".to_string(), Value::String(sanitized));
            }
            map.insert(
                "safety_tolerance".to_string(),
                Value::from(self.relaxed_tolerance),
            );
        }
        relaxed
    }
}

/// Words that commonly trip image-model safety filters, with neutral stand-ins
const REPLACEMENTS: &[(&str, &str)] = &[
    ("blood", "red paint"),
    ("bloody", "dramatic"),
    ("gore", "drama"),
    ("gory", "dramatic"),
    ("kill", "defeat"),
    ("killing", "defeating"),
    ("killed", "defeated"),
    ("dead", "fallen"),
    ("death", "ending"),
    ("gun", "prop"),
    ("guns", "props"),
    ("weapon", "prop"),
    ("weapons", "props"),
    ("knife", "tool"),
    ("shoot", "photograph"),
    ("shooting", "photographing"),
    ("naked", "clothed"),
    ("nude", "clothed"),
    ("sexy", "stylish"),
    ("violent", "intense"),
    ("violence", "action"),
    ("explosion", "burst of light"),
    ("drugs", "supplies"),
];

/// Replace flagged words, keeping surrounding punctuation, and collapse
/// whitespace
pub fn sanitize_prompt(prompt: &str) -> String {
    prompt
        .split_whitespace()
        .map(|word| {
            let start = word
                .find(|c: char| c.is_alphanumeric())
                .unwrap_or(word.len());
            let end = word
                .rfind(|c: char| c.is_alphanumeric())
                .map(|i| i + word[i..].chars().next().map_or(1, char::len_utf8))
                .unwrap_or(start);
            if start >= end {
                return word.to_string();
            }
            let core = &word[start..end];
            let lowered = core.to_lowercase();
            match REPLACEMENTS.iter().find(|(flagged, _)| *flagged == lowered) {
                Some((_, replacement)) => {
                    format!("{}{}{}", &word[..start], replacement, &word[end..])
                }
                None => word.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
