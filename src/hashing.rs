//! Hashing System - SHA-256 for Sources and Artifact Fingerprints
//!
//! Fingerprints make idempotence checkable: an artifact is up to date exactly
//! when its stored fingerprint matches the current source/rule pair.

use serde::Serialize;
use serde_json::{to_string, Value};
use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    let sorted = sort_value(&v);
    to_string(&sorted)
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let sorted_map: serde_json::Map<String, Value> = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            Value::Object(sorted_map)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

/// Fingerprint of one derivation rule, stable across field ordering.
pub fn rule_fingerprint<T: Serialize>(rule: &T) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(rule)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Fingerprint of one artifact:
/// artifact_fingerprint = sha256(source_hash + rule_fingerprint)
///
/// Matches only while both the source bytes and the rule are unchanged.
pub fn artifact_fingerprint(source_hash: &str, rule_fp: &str) -> String {
    sha256_hex(format!("{}:{}", source_hash, rule_fp).as_bytes())
}

// We need hex encoding
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}
