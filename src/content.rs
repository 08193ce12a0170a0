//! Content addressing: canonical serialization hashed into a stable
//! identifier. The id is deterministic, collision-resistant, and independent
//! of attribute iteration order, which makes it usable both as a storage key
//! and as an idempotence token.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

pub trait ContentAddresser: Send + Sync {
    fn content_id(&self, value: &Value) -> Result<String>;
}

/// Canonical JSON (object keys sorted, no insignificant whitespace) digested
/// with SHA-256, rendered as lowercase hex.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Addresser;

impl ContentAddresser for Sha256Addresser {
    fn content_id(&self, value: &Value) -> Result<String> {
        let mut canonical = String::new();
        write_canonical(value, &mut canonical)?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::String(text) => out.push_str(&serde_json::to_string(text)?),
        Value::Array(values) => {
            out.push('[');
            for (index, value) in values.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(value, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}
