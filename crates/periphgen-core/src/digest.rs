//! Content hashing used for cache keys and provenance identities.
//!
//! Metadata digests are computed over canonical JSON (object keys sorted by
//! UTF-16 code units, compact output) so that key order and whitespace in a
//! hand-authored document never change a provenance header.

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Recursively sort JSON object keys using UTF-16 code unit ordering.
fn sort_keys_utf16(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.to_string(), sort_keys_utf16(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_keys_utf16).collect())
        }
        other => other.clone(),
    }
}

/// Canonical compact JSON text of `value`.
pub fn canonical_json(value: &serde_json::Value) -> String {
    // Serializing a `Value` cannot fail; fall back to Display just in case.
    serde_json::to_string(&sort_keys_utf16(value)).unwrap_or_else(|_| value.to_string())
}

/// SHA-256 hex digest of the canonical form of `value`.
pub fn json_digest(value: &serde_json::Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

/// First 12 hex characters of a digest, for log lines.
pub fn short(digest: &str) -> &str {
    &digest[..12.min(digest.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_json_digest_field_order_invariant() {
        let a = serde_json::json!({"name": "stm32f4", "idioms": {"b": true, "a": false}});
        let b = serde_json::json!({"idioms": {"a": false, "b": true}, "name": "stm32f4"});
        assert_eq!(json_digest(&a), json_digest(&b));
    }

    #[test]
    fn test_json_digest_array_order_preserved() {
        let a = serde_json::json!({"flags": ["-O2", "-g"]});
        let b = serde_json::json!({"flags": ["-g", "-O2"]});
        assert_ne!(json_digest(&a), json_digest(&b));
    }

    #[test]
    fn test_canonical_json_is_compact_and_sorted() {
        let v = serde_json::json!({"b": 1, "a": [1, 2]});
        assert_eq!(canonical_json(&v), r#"{"a":[1,2],"b":1}"#);
    }

    #[test]
    fn test_short_digest() {
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
        assert_eq!(short("abc"), "abc");
    }
}
