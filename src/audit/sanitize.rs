//! Payload scrubbing for audit records.

use serde_json::{Map, Value};

/// Substrings that mark a field as sensitive (matched case-insensitively).
pub const SENSITIVE_KEYS: &[&str] = &["password", "token", "secret", "key", "auth", "credential"];

/// Collections longer than this are summarized by count.
pub const MAX_COLLECTION_LEN: usize = 10;

pub const REDACTED: &str = "***REDACTED***";

pub fn is_sensitive(field: &str) -> bool {
    let lower = field.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|k| lower.contains(k))
}

/// Scrub request parameters. Every top-level field is kept (redacted if
/// sensitive); nested collections are summarized when oversized.
pub fn sanitize_request(parameters: &Map<String, Value>) -> Value {
    Value::Object(redact_fields(parameters))
}

/// Scrub a result value: oversized collections collapse to a count summary.
pub fn sanitize_response(value: &Value) -> Value {
    match value {
        Value::Object(map) if map.len() > MAX_COLLECTION_LEN => {
            Value::String(format!("Map with {} entries", map.len()))
        }
        Value::Array(items) if items.len() > MAX_COLLECTION_LEN => {
            Value::String(format!("List with {} items", items.len()))
        }
        Value::Object(map) => Value::Object(redact_fields(map)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_response).collect()),
        other => other.clone(),
    }
}

fn redact_fields(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| {
            let clean = if is_sensitive(k) {
                Value::String(REDACTED.to_string())
            } else {
                sanitize_response(v)
            };
            (k.clone(), clean)
        })
        .collect()
}
