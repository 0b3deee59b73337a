//! Optional LLM response cache.
//!
//! Keys are the SHA-256 of a canonical JSON serialization (recursively
//! sorted keys) of `(op, provider, model, inputs)`, so field order can
//! never cause an accidental miss. The cache may be absent entirely
//! without affecting correctness; `cleanup` drops it wholesale.

use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::store::Store;

/// Serialize a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string serializes"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => serde_json::to_string(other).expect("scalar serializes"),
    }
}

/// Stable cache key for one provider call.
pub fn cache_key(op: &str, provider: &str, model: &str, inputs: &Value) -> String {
    let canonical = canonical_json(&serde_json::json!({
        "op": op,
        "provider": provider,
        "model": model,
        "inputs": inputs,
    }));
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Store-backed cache handle used by the gateway when enabled.
#[derive(Clone)]
pub struct LlmCache {
    store: Arc<Store>,
}

impl LlmCache {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        match self.store.cache_get(key).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "llm cache read failed");
                None
            }
        }
    }

    pub async fn put(&self, key: &str, value: &str) {
        if let Err(e) = self.store.cache_put(key, value).await {
            tracing::debug!(error = %e, "llm cache write failed");
        }
    }
}
