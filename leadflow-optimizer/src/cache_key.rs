//! Query cache key derivation.
//!
//! The key is a SHA-256 over the whitespace-normalized query text and the
//! variables serialized with object keys sorted, so formatting differences
//! and map ordering never split the cache.

use leadflow_core::constants::QUERY_CACHE_KEY_PREFIX;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Collapse whitespace runs outside string literals into one space.
pub fn normalize_query(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut pending_space = false;

    for c in query.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c.is_whitespace() || c == ',' {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    out
}

/// Serialize `value` with every object's keys in sorted order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hex SHA-256 of the normalized query text alone.
pub fn query_hash(query: &str) -> String {
    hex::encode(Sha256::digest(normalize_query(query).as_bytes()))
}

/// Cache key for `query` executed with `variables`.
pub fn query_cache_key(query: &str, variables: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query).as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_json(variables).as_bytes());
    format!("{}{}", QUERY_CACHE_KEY_PREFIX, hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(
            normalize_query("  query   Q {\n\tleads(first: 10) {  id }\n}\n"),
            "query Q { leads(first: 10) { id } }"
        );
    }

    #[test]
    fn test_normalize_keeps_string_literals() {
        assert_eq!(
            normalize_query("{ search(term: \"a   b\\\"  c\") }"),
            "{ search(term: \"a   b\\\"  c\") }"
        );
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let v = json!({"b": 1, "a": {"d": [1, {"z": 0, "y": 1}], "c": null}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"c":null,"d":[1,{"y":1,"z":0}]},"b":1}"#
        );
    }

    #[test]
    fn test_key_ignores_formatting() {
        let vars = json!({"id": 7, "status": "new"});
        let a = query_cache_key("query Lead($id: ID!) { lead(id: $id) { name } }", &vars);
        let b = query_cache_key(
            "query Lead($id: ID!) {\n  lead(id: $id) {\n    name\n  }\n}",
            &json!({"status": "new", "id": 7}),
        );
        assert_eq!(a, b);
        assert!(a.starts_with(QUERY_CACHE_KEY_PREFIX));
        assert_eq!(a.len(), QUERY_CACHE_KEY_PREFIX.len() + 64);
    }

    #[test]
    fn test_key_depends_on_variables() {
        let q = "query Lead($id: ID!) { lead(id: $id) { name } }";
        assert_ne!(
            query_cache_key(q, &json!({"id": 1})),
            query_cache_key(q, &json!({"id": 2}))
        );
        assert_ne!(query_hash(q), query_hash("{ leads { id } }"));
    }
}
