use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Hex sha256 of `input`.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// JSON with object keys sorted at every depth, so structurally equal values
/// serialize identically regardless of insertion order.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                if let Some(inner) = map.get(key) {
                    sorted.insert(key.clone(), canonicalize(inner));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// `tool_cache:<sha256(tool + ":" + canonical params)>`
pub fn tool_cache_key(tool_name: &str, parameters: &Map<String, Value>) -> String {
    let canonical = canonical_json(&Value::Object(parameters.clone()));
    format!("tool_cache:{}", sha256_hex(&format!("{tool_name}:{canonical}")))
}

/// `dedup:<sha256(user|channel|thread|text)>`
pub fn dedup_key(user_id: &str, channel_id: &str, thread_id: &str, text: &str) -> String {
    format!("dedup:{}", sha256_hex(&format!("{user_id}|{channel_id}|{thread_id}|{text}")))
}

pub fn user_limit_key(user_id: &str) -> String {
    format!("ratelimit:user:{user_id}")
}
