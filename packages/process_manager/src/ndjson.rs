//! Tolerant NDJSON decoding: every line becomes an event, parseable or not.

use serde_json::{Value, json};

/// Decode one line of output into an event.
///
/// Valid JSON passes through unchanged. Anything else is wrapped as
/// `{"type": "raw", "data": <line>}`; decoding never fails.
pub fn decode_line(line: &str) -> Value {
    serde_json::from_str(line).unwrap_or_else(|_| raw_event(line))
}

/// The opaque wrapper used for lines that are not JSON
pub fn raw_event(line: &str) -> Value {
    json!({ "type": "raw", "data": line })
}

/// The `type` discriminator of an event, if it has one
pub fn event_type(event: &Value) -> Option<&str> {
    event.get("type").and_then(Value::as_str)
}
