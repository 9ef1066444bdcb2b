//! Canonical JSON encoding used as the signing input for response envelopes.
//!
//! Object keys are sorted lexicographically regardless of the `serde_json`
//! crate's `preserve_order` feature, so the signature is stable across
//! serialization order choices made elsewhere in the gateway.

use serde_json::Value;
use std::collections::BTreeMap;

pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (k, v)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).unwrap());
                out.push(':');
                write_canonical(v, out);
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
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_keys_are_sorted() {
        let value = json!({"b": 1, "a": 2});
        assert_eq!(canonicalize(&value), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn nested_objects_sorted_recursively() {
        let value = json!({"z": {"y": 1, "x": 2}, "a": 3});
        assert_eq!(canonicalize(&value), r#"{"a":3,"z":{"x":2,"y":1}}"#);
    }

    #[test]
    fn arrays_preserve_order() {
        let value = json!([3, 1, 2]);
        assert_eq!(canonicalize(&value), "[3,1,2]");
    }
}
