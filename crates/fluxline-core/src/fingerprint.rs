//! Schema canonicalization and fingerprinting.
//!
//! A fingerprint is a SHA-256 hex digest of the canonicalized schema JSON.
//! Canonicalization sorts object keys recursively, so two schemas that differ
//! only in key order produce identical fingerprints. Once stored on a dataset
//! version the fingerprint is never recomputed; immutability, not
//! re-validation, is the guarantee.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Recursively sort object keys, leaving arrays in order.
///
/// Sorting is applied explicitly so the fingerprint does not depend on
/// serde_json's map implementation (the `preserve_order` feature changes it).
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let canonical = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            Value::Object(canonical)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serialize a JSON value in canonical form.
pub fn canonical_string(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// SHA-256 hex digest of arbitrary text.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Fingerprint of a schema: SHA-256 over its canonical serialization.
pub fn schema_fingerprint(schema: &Value) -> String {
    sha256_hex(&canonical_string(schema))
}

/// Number of columns a schema declares, when it follows the
/// `{"columns": [...]}` shape.
pub fn column_count(schema: &Value) -> i64 {
    schema
        .get("columns")
        .and_then(Value::as_array)
        .map(|cols| cols.len() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_key_order_independent() {
        let a = json!({
            "columns": [
                {"name": "id", "type": "INTEGER", "nullable": false},
                {"name": "name", "type": "VARCHAR", "nullable": true}
            ]
        });
        let b = json!({
            "columns": [
                {"nullable": false, "type": "INTEGER", "name": "id"},
                {"type": "VARCHAR", "nullable": true, "name": "name"}
            ]
        });
        assert_eq!(schema_fingerprint(&a), schema_fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_detects_content_change() {
        let a = json!({"columns": [{"name": "id", "type": "INTEGER"}]});
        let b = json!({"columns": [{"name": "id", "type": "BIGINT"}]});
        assert_ne!(schema_fingerprint(&a), schema_fingerprint(&b));
    }

    #[test]
    fn test_column_order_is_significant() {
        // Arrays carry meaning; reordering columns is a schema change.
        let a = json!({"columns": [{"name": "a"}, {"name": "b"}]});
        let b = json!({"columns": [{"name": "b"}, {"name": "a"}]});
        assert_ne!(schema_fingerprint(&a), schema_fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = schema_fingerprint(&json!({"columns": []}));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_column_count() {
        let schema = json!({"columns": [{"name": "a"}, {"name": "b"}, {"name": "c"}]});
        assert_eq!(column_count(&schema), 3);
        assert_eq!(column_count(&json!({})), 0);
        assert_eq!(column_count(&json!({"columns": "oops"})), 0);
    }

    #[test]
    fn test_sha256_hex_known_value() {
        // SHA-256 of the empty string
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
