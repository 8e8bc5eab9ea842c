// Dedup key derivation
//
// A payload supplies its own key through the configured extractor. Payloads
// without a usable key get a wall-clock key carrying a per-queue sequence
// number, so two keyless payloads landing in the same millisecond never
// collide.

use chrono::Utc;
use serde_json::Value;

/// Identity used to suppress duplicate payloads within one accumulation window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    /// Extracted from the payload itself.
    Field(String),
    /// Synthesized at insertion time for payloads without a usable key.
    Synthetic { epoch_millis: i64, seq: u64 },
}

pub(crate) fn synthetic(seq: u64) -> DedupKey {
    DedupKey::Synthetic {
        epoch_millis: Utc::now().timestamp_millis(),
        seq,
    }
}

/// Looks up `field` in a JSON payload and renders it as a key string.
///
/// Mirrors the loose acceptance rules of analytics payloads: `null`, `false`,
/// `0` and the empty string all count as "no key there".
pub(crate) fn truthy_field(payload: &Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::Null => None,
        Value::Bool(false) => None,
        Value::Bool(true) => Some("true".to_string()),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
