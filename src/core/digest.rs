//! Canonical JSON encoding and SHA-256 helpers.
//!
//! Every content address in the crate (snapshot hashes, world ids, execution
//! keys, schema hashes) goes through `canonical_json_bytes`, so key insertion
//! order never leaks into a hash.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Recursively rebuild `value` with object keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    // Serializing a `Value` cannot fail: keys are strings and numbers are finite.
    serde_json::to_vec(&canonicalize(value)).unwrap_or_default()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash a sequence of labelled parts with length framing, so `("ab","c")` and
/// `("a","bc")` never collide.
pub fn framed_hash(parts: &[(&str, &[u8])]) -> String {
    let mut hasher = Sha256::new();
    for (label, bytes) in parts {
        hasher.update((label.len() as u64).to_be_bytes());
        hasher.update(label.as_bytes());
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    format!("{:x}", hasher.finalize())
}
