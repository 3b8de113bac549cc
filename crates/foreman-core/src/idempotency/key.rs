//! Idempotency key derivation.
//!
//! The key is a SHA-256 over the tool name, a canonical JSON rendering of the
//! input, and the optional explicit key. Canonical JSON sorts object keys at
//! every depth and drops object fields whose value is `null`, so an absent
//! field and an explicit `null` produce the same key. Nulls inside arrays are
//! positional and kept.

use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn derive_key(tool: &str, input: &Value, explicit_key: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(input).as_bytes());
    hasher.update([0u8]);
    match explicit_key {
        Some(key) => {
            hasher.update(b"k:");
            hasher.update(key.as_bytes());
        }
        None => hasher.update(b"-"),
    }
    hex::encode(hasher.finalize())
}

pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> =
                map.iter().filter(|(_, v)| !v.is_null()).collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(field, out);
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
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
}

fn write_string(s: &str, out: &mut String) {
    // Serializing a &str cannot fail.
    out.push_str(&Value::String(s.to_string()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn key_ignores_field_order_and_null_fields() {
        let a = json!({"path": "/x", "content": "y", "mode": null});
        let b = json!({"content": "y", "path": "/x"});
        assert_eq!(derive_key("write_file", &a, None), derive_key("write_file", &b, None));
    }

    #[test]
    fn nested_objects_are_canonicalized() {
        let a = json!({"outer": {"b": 1, "a": [1, null, {"z": 1, "y": null}]}});
        assert_eq!(
            canonical_json(&a),
            r#"{"outer":{"a":[1,null,{"z":1}],"b":1}}"#
        );
    }

    #[test]
    fn tool_name_and_explicit_key_separate_keys() {
        let input = json!({"path": "/x"});
        let base = derive_key("write_file", &input, None);
        assert_ne!(base, derive_key("read_file", &input, None));
        assert_ne!(base, derive_key("write_file", &input, Some("run-1")));
        assert_ne!(
            derive_key("write_file", &input, Some("run-1")),
            derive_key("write_file", &input, Some("run-2"))
        );
        assert_ne!(base, derive_key("write_file", &input, Some("")));
    }

    #[test]
    fn different_values_do_not_collide() {
        let a = json!({"path": "/x", "content": "y"});
        let b = json!({"path": "/x", "content": "z"});
        let c = json!({"path": "/x", "content": ["y"]});
        let ka = derive_key("write_file", &a, None);
        assert_ne!(ka, derive_key("write_file", &b, None));
        assert_ne!(ka, derive_key("write_file", &c, None));
    }

    #[test]
    fn strings_are_escaped() {
        let tricky = json!({"a\",\"b": "c"});
        let split = json!({"a": "", "b": "c"});
        assert_ne!(canonical_json(&tricky), canonical_json(&split));
    }

    fn shuffled_object() -> impl Strategy<Value = (Vec<(String, i64)>, Vec<usize>)> {
        prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 1..8).prop_flat_map(|map| {
            let entries: Vec<(String, i64)> = map.into_iter().collect();
            let len = entries.len();
            (
                Just(entries),
                Just((0..len).collect::<Vec<_>>()).prop_shuffle(),
            )
        })
    }

    proptest! {
        #[test]
        fn key_is_independent_of_insertion_order((entries, order) in shuffled_object()) {
            let mut forward = serde_json::Map::new();
            for (k, v) in &entries {
                forward.insert(k.clone(), json!(v));
            }
            let mut shuffled = serde_json::Map::new();
            for i in &order {
                let (k, v) = &entries[*i];
                shuffled.insert(k.clone(), json!(v));
            }
            shuffled.insert("_absent".to_string(), Value::Null);

            prop_assert_eq!(
                derive_key("tool", &Value::Object(forward), None),
                derive_key("tool", &Value::Object(shuffled), None)
            );
        }
    }
}
