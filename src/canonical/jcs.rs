//! RFC 8785 (JCS) canonical JSON emission.
//!
//! Canonical form: lexicographically sorted object keys, no whitespace,
//! minimal string escaping, and deterministic number formatting. Numbers
//! are kept inside a plain-decimal window (|x| < 1e21, and |x| ≥ 1e-6 when
//! fractional) so the emitted form never needs exponent notation; integral
//! floats emit as integers. Scores and confidences in this system are
//! two-decimal values well inside that window.

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use crate::error::CanonicalError;

/// Maximum nesting depth accepted by the canonicalizer.
pub const MAX_DEPTH: usize = 128;

/// Produces the canonical JSON string for a value.
pub fn to_canonical_string(value: &Value) -> Result<String, CanonicalError> {
    let mut out = String::new();
    emit_value(value, &mut out, 0)?;
    Ok(out)
}

/// Canonical JSON encoded as UTF-8 bytes, ready for hashing.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    Ok(to_canonical_string(value)?.into_bytes())
}

/// `sha256:<hex>` digest of raw bytes, the form every artifact reference
/// carries.
pub fn sha256_prefixed(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("sha256:{}", hex::encode(digest))
}

/// Digest of a value's canonical JSON bytes.
pub fn canonical_sha256(value: &Value) -> Result<String, CanonicalError> {
    Ok(sha256_prefixed(&canonical_bytes(value)?))
}

/// Digest of an evidence snippet's UTF-8 bytes.
pub fn snippet_sha256(snippet: &str) -> String {
    sha256_prefixed(snippet.as_bytes())
}

fn emit_value(value: &Value, out: &mut String, depth: usize) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::MaxDepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => emit_number(n, out)?,
        Value::String(s) => emit_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_value(item, out, depth + 1)?;
            }
            out.push(']');
        }
        Value::Object(obj) => emit_object(obj, out, depth)?,
    }
    Ok(())
}

fn emit_object(obj: &Map<String, Value>, out: &mut String, depth: usize) -> Result<(), CanonicalError> {
    let mut keys: Vec<&String> = obj.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        emit_string(key, out);
        out.push(':');
        emit_value(&obj[*key], out, depth + 1)?;
    }
    out.push('}');
    Ok(())
}

fn emit_number(n: &Number, out: &mut String) -> Result<(), CanonicalError> {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
        return Ok(());
    }
    let f = n.as_f64().ok_or(CanonicalError::NonFiniteNumber)?;
    if !f.is_finite() {
        return Err(CanonicalError::NonFiniteNumber);
    }
    // Integral floats emit as integers per JCS (ES `Number::toString`).
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        out.push_str(&format!("{}", f as i64));
        return Ok(());
    }
    // Outside the plain-decimal window Rust's shortest formatting and the
    // JCS exponent form diverge, so such numbers are rejected outright.
    if f.abs() >= 1e21 || f.abs() < 1e-6 {
        return Err(CanonicalError::NumberOutOfWindow {
            value: f.to_string(),
        });
    }
    out.push_str(&f.to_string());
    Ok(())
}

/// Minimal escaping per RFC 8785 §3.2.2.2: only `"`, `\` and the C0
/// controls are escaped; short escapes where defined, `\u00xx` otherwise.
fn emit_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let value = json!({"z": 1, "a": 2, "m": 3});
        assert_eq!(to_canonical_string(&value).unwrap(), r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn sorts_nested_keys() {
        let value = json!({"outer": {"z": 1, "a": 2}});
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            r#"{"outer":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn arrays_preserve_order() {
        let value = json!([3, 1, 2]);
        assert_eq!(to_canonical_string(&value).unwrap(), "[3,1,2]");
    }

    #[test]
    fn primitives() {
        assert_eq!(to_canonical_string(&json!(null)).unwrap(), "null");
        assert_eq!(to_canonical_string(&json!(true)).unwrap(), "true");
        assert_eq!(to_canonical_string(&json!(42)).unwrap(), "42");
        assert_eq!(to_canonical_string(&json!(-7)).unwrap(), "-7");
        assert_eq!(to_canonical_string(&json!("hi")).unwrap(), "\"hi\"");
    }

    #[test]
    fn confidence_floats_emit_shortest_form() {
        assert_eq!(to_canonical_string(&json!(0.95)).unwrap(), "0.95");
        assert_eq!(to_canonical_string(&json!(0.72)).unwrap(), "0.72");
        assert_eq!(to_canonical_string(&json!(0.5)).unwrap(), "0.5");
    }

    #[test]
    fn integral_floats_emit_as_integers() {
        assert_eq!(to_canonical_string(&json!(1.0)).unwrap(), "1");
        assert_eq!(to_canonical_string(&json!(0.0)).unwrap(), "0");
    }

    #[test]
    fn exponent_range_is_rejected() {
        let big = serde_json::Number::from_f64(1e22).unwrap();
        let err = to_canonical_string(&Value::Number(big)).unwrap_err();
        assert!(matches!(err, CanonicalError::NumberOutOfWindow { .. }));

        let tiny = serde_json::Number::from_f64(1e-9).unwrap();
        let err = to_canonical_string(&Value::Number(tiny)).unwrap_err();
        assert!(matches!(err, CanonicalError::NumberOutOfWindow { .. }));
    }

    #[test]
    fn escapes_control_characters() {
        let value = json!({"text": "line1\nline2\ttab"});
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            r#"{"text":"line1\nline2\ttab"}"#
        );
        let value = json!({"text": "\u{0001}"});
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            "{\"text\":\"\\u0001\"}"
        );
    }

    #[test]
    fn del_and_c1_controls_stay_raw() {
        let value = json!({"t": "\u{007F}\u{0085}"});
        let out = to_canonical_string(&value).unwrap();
        assert!(!out.contains("\\u007f"));
        assert!(!out.contains("\\u0085"));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut value = json!(0);
        for _ in 0..(MAX_DEPTH + 5) {
            value = json!({ "n": value });
        }
        let err = to_canonical_string(&value).unwrap_err();
        assert!(matches!(err, CanonicalError::MaxDepthExceeded { .. }));
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let value = json!({"b": {"d": 4, "c": [1, 2]}, "a": 1});
        let first = to_canonical_string(&value).unwrap();
        let reparsed: Value = serde_json::from_str(&first).unwrap();
        let second = to_canonical_string(&reparsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn key_order_does_not_change_digest() {
        let a = json!({"x": 1, "y": {"q": true, "p": "s"}});
        let b = json!({"y": {"p": "s", "q": true}, "x": 1});
        assert_eq!(canonical_sha256(&a).unwrap(), canonical_sha256(&b).unwrap());
    }

    #[test]
    fn sha256_prefix_format() {
        let digest = sha256_prefixed(b"hello");
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest.len(), "sha256:".len() + 64);
        assert_eq!(digest, snippet_sha256("hello"));
    }
}
