//! Deterministic serialization of structured payloads for hashing.
//!
//! Object keys are emitted in lexicographic (byte) order at every depth, arrays
//! keep their order, and no insignificant whitespace is produced. Two payloads
//! canonicalize to the same bytes iff they are structurally equal as JSON
//! values.
use serde::Serialize;
use serde_json::Value;

/// Canonical bytes of any serializable payload.
pub fn canonicalize<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(payload)?;
    Ok(canonical_string(&value).into_bytes())
}

/// Hex sha256 over the canonical bytes of `payload`.
pub fn payload_hash<T: Serialize + ?Sized>(payload: &T) -> Result<String, serde_json::Error> {
    let bytes = canonicalize(payload)?;
    Ok(sha256::digest(&bytes))
}

pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::String(text) => write_string(text, out),
        // null, booleans and numbers have a single json rendering
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_string(text: &str, out: &mut String) {
    out.push_str(&Value::String(text.to_owned()).to_string());
}
