//! Canonical JSON rendering for deterministic signatures.
//!
//! Canonical form has:
//! - Object keys sorted lexicographically (UTF-8 byte order)
//! - No whitespace
//! - Array order preserved
//!
//! Key order is sorted explicitly rather than relying on the map type, so the
//! output stays stable even if another crate in the graph turns on
//! `serde_json/preserve_order`.

use serde_json::Value;

/// Render `value` as canonical JSON.
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            out.push_str(&value.to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_value(out, &map[key]);
            }
            out.push('}');
        }
    }
}
