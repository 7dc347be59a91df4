//! Tagged attribute tree for declared and observed resource attributes.
//!
//! Configuration blocks arrive as loosely typed JSON/YAML. They are converted
//! into [`AttributeValue`] trees under the direction of a resource schema, so
//! that ordered lists and unordered sets compare differently.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Attributes of a resource, keyed by attribute or block name.
pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// String.
    String(String),
    /// Ordered sequence (element order is significant).
    List(Vec<AttributeValue>),
    /// Unordered collection (element order is ignored).
    Set(Vec<AttributeValue>),
    /// Nested block.
    Block(BTreeMap<String, AttributeValue>),
}

/// A single leaf-level difference between two attribute trees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeChange {
    /// Concrete path of the changed attribute (e.g. `routing_rule[0].name`).
    pub path: String,
    /// Previous value, if any.
    pub old: Option<AttributeValue>,
    /// New value, if any.
    pub new: Option<AttributeValue>,
}

impl AttributeValue {
    /// Converts a JSON value into an attribute tree.
    ///
    /// `path` is the normalized path of `value`; `is_unordered` decides
    /// whether an array at a given normalized path becomes a [`Self::Set`].
    #[must_use]
    pub fn from_json(value: &Value, path: &str, is_unordered: &dyn Fn(&str) -> bool) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or_default()), Self::Int),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => {
                let converted = items
                    .iter()
                    .map(|item| Self::from_json(item, path, is_unordered))
                    .collect();
                if is_unordered(path) {
                    Self::Set(converted)
                } else {
                    Self::List(converted)
                }
            }
            Value::Object(fields) => Self::Block(
                fields
                    .iter()
                    .map(|(k, v)| {
                        let child = join_path(path, k);
                        (k.clone(), Self::from_json(v, &child, is_unordered))
                    })
                    .collect(),
            ),
        }
    }

    /// Converts the attribute tree back into plain JSON.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Self::String(s) => Value::String(s.clone()),
            Self::List(items) | Self::Set(items) => {
                Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Block(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Returns the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns true for [`Self::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Computes a canonical fingerprint of this value.
    ///
    /// Set elements are fingerprinted individually and sorted, so two sets
    /// holding the same elements in any order share a fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        self.feed(&mut hasher);
        hex::encode(hasher.finalize())
    }

    fn feed(&self, hasher: &mut Sha256) {
        match self {
            Self::Null => hasher.update([0u8]),
            Self::Bool(b) => {
                hasher.update([1u8]);
                hasher.update([u8::from(*b)]);
            }
            // Integers and whole floats hash alike; remotes often echo 80 as 80.0.
            Self::Int(i) => {
                hasher.update([2u8]);
                hasher.update(i.to_string().as_bytes());
            }
            Self::Float(f) => {
                hasher.update([2u8]);
                hasher.update(format_float(*f).as_bytes());
            }
            Self::String(s) => {
                hasher.update([3u8]);
                hasher.update((s.len() as u64).to_be_bytes());
                hasher.update(s.as_bytes());
            }
            Self::List(items) => {
                hasher.update([4u8]);
                hasher.update((items.len() as u64).to_be_bytes());
                for item in items {
                    item.feed(hasher);
                }
            }
            Self::Set(items) => {
                hasher.update([5u8]);
                let mut prints: Vec<String> = items.iter().map(Self::fingerprint).collect();
                prints.sort_unstable();
                hasher.update((prints.len() as u64).to_be_bytes());
                for print in prints {
                    hasher.update(print.as_bytes());
                }
            }
            Self::Block(fields) => {
                hasher.update([6u8]);
                hasher.update((fields.len() as u64).to_be_bytes());
                for (key, value) in fields {
                    hasher.update(key.as_bytes());
                    value.feed(hasher);
                }
            }
        }
    }

    /// Returns a copy with ignored keys and null block entries removed.
    ///
    /// `path` is the normalized path of this value; list and set elements
    /// share their container's path.
    #[must_use]
    pub fn canonical(&self, path: &str, ignore: &dyn Fn(&str) -> bool) -> Self {
        match self {
            Self::Block(fields) => Self::Block(
                fields
                    .iter()
                    .filter_map(|(key, value)| {
                        let child = join_path(path, key);
                        (!value.is_null() && !ignore(&child)).then(|| (key.clone(), value.canonical(&child, ignore)))
                    })
                    .collect(),
            ),
            Self::List(items) => Self::List(items.iter().map(|item| item.canonical(path, ignore)).collect()),
            Self::Set(items) => Self::Set(items.iter().map(|item| item.canonical(path, ignore)).collect()),
            other => other.clone(),
        }
    }

    /// Deep structural comparison.
    ///
    /// Lists are order-sensitive, sets are order-insensitive, and integers
    /// compare equal to floats with the same value.
    #[must_use]
    pub fn equivalent(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Set(a), Self::Set(b)) => a.len() == b.len() && self.fingerprint() == other.fingerprint(),
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equivalent(y))
            }
            (Self::Block(a), Self::Block(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other| v.equivalent(other)))
            }
            #[allow(clippy::cast_precision_loss)]
            (Self::Int(i), Self::Float(f)) | (Self::Float(f), Self::Int(i)) => (*i as f64 - *f).abs() < f64::EPSILON,
            _ => self == other,
        }
    }
}

/// Converts a JSON object into an attribute map.
///
/// Non-object input yields an empty map.
#[must_use]
pub fn map_from_json(value: &Value, is_unordered: &dyn Fn(&str) -> bool) -> AttributeMap {
    match value {
        Value::Object(fields) => fields
            .iter()
            .map(|(k, v)| (k.clone(), AttributeValue::from_json(v, k, is_unordered)))
            .collect(),
        _ => AttributeMap::new(),
    }
}

/// Converts an attribute map into a JSON object.
#[must_use]
pub fn map_to_json(map: &AttributeMap) -> Value {
    Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

/// Computes the leaf-level differences from `old` to `new`.
///
/// Attributes whose normalized path satisfies `ignore` are skipped on both
/// sides.
#[must_use]
pub fn diff_maps(
    old: &AttributeMap,
    new: &AttributeMap,
    ignore: &dyn Fn(&str) -> bool,
) -> Vec<AttributeChange> {
    let mut changes = Vec::new();
    diff_blocks(old, new, "", ignore, &mut changes);
    changes
}

fn diff_blocks(
    old: &BTreeMap<String, AttributeValue>,
    new: &BTreeMap<String, AttributeValue>,
    prefix: &str,
    ignore: &dyn Fn(&str) -> bool,
    changes: &mut Vec<AttributeChange>,
) {
    let mut keys: Vec<&String> = old.keys().chain(new.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        let path = join_path(prefix, key);
        if ignore(&normalize_path(&path)) {
            continue;
        }
        match (old.get(key), new.get(key)) {
            (Some(a), Some(b)) => diff_values(a, b, &path, ignore, changes),
            (a, b) => {
                // A missing key and an explicit null mean the same thing.
                if a.is_some_and(|v| !v.is_null()) || b.is_some_and(|v| !v.is_null()) {
                    changes.push(AttributeChange {
                        path,
                        old: a.cloned(),
                        new: b.cloned(),
                    });
                }
            }
        }
    }
}

fn diff_values(
    old: &AttributeValue,
    new: &AttributeValue,
    path: &str,
    ignore: &dyn Fn(&str) -> bool,
    changes: &mut Vec<AttributeChange>,
) {
    match (old, new) {
        (AttributeValue::Block(a), AttributeValue::Block(b)) => {
            diff_blocks(a, b, path, ignore, changes);
        }
        (AttributeValue::List(a), AttributeValue::List(b)) if a.len() == b.len() => {
            for (i, (x, y)) in a.iter().zip(b).enumerate() {
                diff_values(x, y, &format!("{path}[{i}]"), ignore, changes);
            }
        }
        (AttributeValue::Set(_), AttributeValue::Set(_)) => {
            let normalized = normalize_path(path);
            if !old
                .canonical(&normalized, ignore)
                .equivalent(&new.canonical(&normalized, ignore))
            {
                changes.push(AttributeChange {
                    path: path.to_string(),
                    old: Some(old.clone()),
                    new: Some(new.clone()),
                });
            }
        }
        _ => {
            if !old.equivalent(new) {
                changes.push(AttributeChange {
                    path: path.to_string(),
                    old: Some(old.clone()),
                    new: Some(new.clone()),
                });
            }
        }
    }
}

/// A value found while walking an attribute path.
#[derive(Debug, Clone, Copy)]
pub struct PathMatch<'a> {
    /// Value at the path, `None` when the final key is absent.
    pub value: Option<&'a AttributeValue>,
}

/// Resolves a normalized path against an attribute map.
///
/// Lists and sets along the way are traversed element by element, so a path
/// such as `routing_rule.forwarding_configuration.backend_pool_name` yields
/// one entry per routing rule. Each entry carries its concrete path.
#[must_use]
pub fn resolve_path<'a>(map: &'a AttributeMap, path: &str) -> Vec<(String, PathMatch<'a>)> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let mut out = Vec::new();
    if let Some((first, rest)) = segments.split_first() {
        let child = map.get(*first);
        if rest.is_empty() {
            out.push(((*first).to_string(), PathMatch { value: child }));
        } else if let Some(value) = child.filter(|v| !v.is_null()) {
            visit(value, rest, (*first).to_string(), &mut out);
        } else {
            out.push((path.to_string(), PathMatch { value: None }));
        }
    }
    out
}

fn visit<'a>(
    value: &'a AttributeValue,
    segments: &[&str],
    concrete: String,
    out: &mut Vec<(String, PathMatch<'a>)>,
) {
    match value {
        AttributeValue::List(items) | AttributeValue::Set(items) => {
            for (i, item) in items.iter().enumerate() {
                visit(item, segments, format!("{concrete}[{i}]"), out);
            }
        }
        AttributeValue::Block(fields) => {
            let Some((first, rest)) = segments.split_first() else {
                return;
            };
            let path = join_path(&concrete, first);
            let child = fields.get(*first);
            if rest.is_empty() {
                out.push((path, PathMatch { value: child }));
            } else if let Some(next) = child.filter(|v| !v.is_null()) {
                visit(next, rest, path, out);
            } else {
                out.push((path, PathMatch { value: None }));
            }
        }
        _ => {}
    }
}

/// Strips list indices from a concrete path: `a[0].b[2].c` becomes `a.b.c`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut depth = 0usize;
    for ch in path.chars() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        #[allow(clippy::cast_possible_truncation)]
        let whole = f as i64;
        whole.to_string()
    } else {
        f.to_string()
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "\"{s}\""),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |v: &Option<AttributeValue>| {
            v.as_ref().map_or_else(|| String::from("(none)"), ToString::to_string)
        };
        write!(f, "{}: {} -> {}", self.path, render(&self.old), render(&self.new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unordered_protocols(path: &str) -> bool {
        path == "accepted_protocols"
    }

    #[test]
    fn test_schema_directed_conversion() {
        let map = map_from_json(
            &json!({
                "accepted_protocols": ["Http", "Https"],
                "patterns_to_match": ["/*"],
                "http_port": 80
            }),
            &unordered_protocols,
        );

        assert!(matches!(map["accepted_protocols"], AttributeValue::Set(_)));
        assert!(matches!(map["patterns_to_match"], AttributeValue::List(_)));
        assert_eq!(map["http_port"], AttributeValue::Int(80));
    }

    #[test]
    fn test_set_reorder_is_equivalent() {
        let a = map_from_json(&json!({"accepted_protocols": ["Http", "Https"]}), &unordered_protocols);
        let b = map_from_json(&json!({"accepted_protocols": ["Https", "Http"]}), &unordered_protocols);

        assert!(diff_maps(&a, &b, &|_: &str| false).is_empty());
    }

    #[test]
    fn test_list_reorder_is_a_change() {
        let a = map_from_json(&json!({"patterns_to_match": ["/a", "/b"]}), &|_: &str| false);
        let b = map_from_json(&json!({"patterns_to_match": ["/b", "/a"]}), &|_: &str| false);

        let changes = diff_maps(&a, &b, &|_: &str| false);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].path, "patterns_to_match[0]");
    }

    #[test]
    fn test_nested_leaf_diff() {
        let a = map_from_json(
            &json!({"backend": [{"address": "www.bing.com", "http_port": 80}]}),
            &|_: &str| false,
        );
        let b = map_from_json(
            &json!({"backend": [{"address": "www.bing.com", "http_port": 8080}]}),
            &|_: &str| false,
        );

        let changes = diff_maps(&a, &b, &|_: &str| false);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "backend[0].http_port");
        assert_eq!(changes[0].new, Some(AttributeValue::Int(8080)));
    }

    #[test]
    fn test_ignored_paths_and_nulls() {
        let a = map_from_json(&json!({"name": "x", "id": "remote-1"}), &|_: &str| false);
        let b = map_from_json(&json!({"name": "x", "tag": null}), &|_: &str| false);

        assert!(diff_maps(&a, &b, &|p: &str| p == "id").is_empty());
    }

    #[test]
    fn test_set_elements_skip_ignored_keys_and_nulls() {
        let unordered = |p: &str| p == "backend";
        let declared = map_from_json(&json!({"backend": [{"address": "a"}, {"address": "b"}]}), &unordered);
        let observed = map_from_json(
            &json!({"backend": [{"address": "b", "id": "b-2", "weight": null}, {"address": "a", "id": "b-1"}]}),
            &unordered,
        );

        assert!(diff_maps(&observed, &declared, &|p: &str| p == "backend.id").is_empty());
        assert_eq!(diff_maps(&observed, &declared, &|_: &str| false).len(), 1);
    }

    #[test]
    fn test_int_float_equivalence() {
        assert!(AttributeValue::Int(443).equivalent(&AttributeValue::Float(443.0)));
        assert_eq!(
            AttributeValue::Int(443).fingerprint(),
            AttributeValue::Float(443.0).fingerprint()
        );
    }

    #[test]
    fn test_resolve_path_through_lists() {
        let map = map_from_json(
            &json!({
                "forwarding_configuration": [
                    {"backend_pool_name": "backend-bing"},
                    {"forwarding_protocol": "MatchRequest"}
                ]
            }),
            &|_: &str| false,
        );

        let found = resolve_path(&map, "forwarding_configuration.backend_pool_name");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, "forwarding_configuration[0].backend_pool_name");
        assert_eq!(found[0].1.value.and_then(AttributeValue::as_str), Some("backend-bing"));
        assert!(found[1].1.value.is_none());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a[0].b[12].c"), "a.b.c");
        assert_eq!(normalize_path("plain"), "plain");
    }
}
