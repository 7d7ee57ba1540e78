//! Canonical JSON encoding and SHA-256 fingerprinting (§4.1).
//!
//! Any two specifications that differ only in key order, whitespace, or
//! representation of equivalent numbers must yield the same fingerprint —
//! canonicalization is what makes that true, and the fingerprint is just
//! SHA-256 over the canonical bytes.

use sha2::{Digest, Sha256};

/// Render `value` as canonical JSON: object keys sorted ascending by
/// code-point, no insignificant whitespace, minimal string escaping.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value::*;
    match value {
        Null => out.push_str("null"),
        Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Number(n) => out.push_str(&n.to_string()),
        String(s) => out.push_str(&quote(s)),
        Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&quote(key));
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// JSON-quote a string with the minimal required escaping, preserving UTF-8.
fn quote(s: &str) -> String {
    // serde_json's string serializer already escapes only what JSON
    // requires (quote, backslash, control characters) and leaves the rest
    // of UTF-8 untouched, so delegate to it for the leaf case.
    serde_json::to_string(s).expect("string serialization is infallible")
}

/// SHA-256 of the canonical UTF-8 bytes, lowercase hex (64 characters).
pub fn fingerprint(value: &serde_json::Value) -> String {
    let canonical = canonical_json(value);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_fingerprint() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn whitespace_does_not_affect_canonical_form() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a": 1,  "b":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn nested_objects_sort_recursively() {
        let value = json!({"z": {"y": 1, "x": 2}, "a": 1});
        assert_eq!(canonical_json(&value), r#"{"a":1,"z":{"x":2,"y":1}}"#);
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let value = json!({"b": [3, 1, {"q": 1, "p": 2}], "a": "hi"});
        let once = canonical_json(&value);
        let reparsed: serde_json::Value = serde_json::from_str(&once).unwrap();
        let twice = canonical_json(&reparsed);
        assert_eq!(once, twice);
    }

    #[test]
    fn fingerprint_is_64_hex_chars() {
        let digest = fingerprint(&json!({"v": 1}));
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
