//! Deterministic hashing of JSON values for cache keys.
//!
//! Values are written in a canonical form (object keys sorted, no whitespace) into a
//! thread-local buffer and hashed with SHA-256, so two requests whose params differ only in
//! key order or formatting map to the same key.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{cell::RefCell, fmt::Write};

thread_local! {
    static JSON_BUFFER: RefCell<String> = RefCell::new(String::with_capacity(2048));
}

/// Appends the canonical encoding of `value` to `out`.
pub fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_string()).to_string());
}

/// Returns the canonical encoding of `value`.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Lowercase hex SHA-256 of the canonical encoding of `value`.
#[must_use]
pub fn sha256_canonical(value: &Value) -> String {
    JSON_BUFFER.with(|buffer| {
        let mut buffer = buffer.borrow_mut();
        buffer.clear();
        write_canonical(value, &mut buffer);
        hex::encode(Sha256::digest(buffer.as_bytes()))
    })
}
