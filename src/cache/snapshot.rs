use super::key::reference_target;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Flat, JSON-serializable export of the normalized store: identity key to
/// field map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheSnapshot {
    entries: BTreeMap<String, Map<String, Value>>,
}

impl CacheSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<String, Map<String, Value>>) -> Self {
        Self { entries }
    }

    /// Accepts any JSON object whose values are all objects.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(root) = value else {
            return Err(Error::normalization_with_context(
                "cache snapshot must be a JSON object",
                ErrorContext::new().with_source("cache_snapshot"),
            ));
        };
        let mut entries = BTreeMap::new();
        for (key, entry) in root {
            match entry {
                Value::Object(fields) => {
                    entries.insert(key, fields);
                }
                other => {
                    return Err(Error::normalization_with_context(
                        "cache entry must be a JSON object",
                        ErrorContext::new()
                            .with_field_path(key)
                            .with_details(format!("found {}", kind_name(&other)))
                            .with_source("cache_snapshot"),
                    ));
                }
            }
        }
        Ok(Self { entries })
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(s)?)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), Value::Object(v.clone())))
                .collect(),
        )
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.entries)?)
    }

    pub fn get(&self, key: &str) -> Option<&Map<String, Value>> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, Map<String, Value>> {
        &self.entries
    }

    pub fn into_entries(self) -> BTreeMap<String, Map<String, Value>> {
        self.entries
    }

    /// Fails on the first reference whose target entry is absent.
    pub fn validate(&self) -> Result<()> {
        for (key, fields) in &self.entries {
            for (field, value) in fields {
                if let Some(target) = first_dangling(value, &|k| self.entries.contains_key(k)) {
                    return Err(Error::normalization_with_context(
                        format!("dangling reference to '{}'", target),
                        ErrorContext::new()
                            .with_field_path(format!("{}.{}", key, field))
                            .with_source("cache_snapshot"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// First reference inside `value` for which `exists` returns false.
pub(crate) fn first_dangling<'a>(value: &'a Value, exists: &dyn Fn(&str) -> bool) -> Option<&'a str> {
    if let Some(target) = reference_target(value) {
        return (!exists(target)).then_some(target);
    }
    match value {
        Value::Array(items) => items.iter().find_map(|v| first_dangling(v, exists)),
        Value::Object(map) => map.values().find_map(|v| first_dangling(v, exists)),
        _ => None,
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_non_object_entries() {
        assert!(CacheSnapshot::from_value(json!([1])).is_err());
        let err = CacheSnapshot::from_value(json!({"User:1": 3})).unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("User:1")
        );
    }

    #[test]
    fn validate_finds_dangling_references() {
        let ok = CacheSnapshot::from_value(json!({
            "ROOT_QUERY": {"me": {"__ref": "User:1"}, "feed": [{"__ref": "Post:1"}]},
            "User:1": {"id": 1},
            "Post:1": {"author": {"__ref": "User:1"}}
        }))
        .unwrap();
        assert!(ok.validate().is_ok());

        let bad = CacheSnapshot::from_value(json!({
            "ROOT_QUERY": {"feed": [{"__ref": "Post:9"}]}
        }))
        .unwrap();
        assert!(matches!(bad.validate(), Err(Error::Normalization { .. })));
    }

    #[test]
    fn json_text_is_lossless() {
        let value = json!({"K:1": {"n": 1.5, "s": "x", "b": false, "z": null, "l": [1, [2]], "m": {"a": {}}}});
        let snapshot = CacheSnapshot::from_value(value.clone()).unwrap();
        let text = snapshot.to_json_string().unwrap();
        assert_eq!(CacheSnapshot::from_json_str(&text).unwrap().to_value(), value);
    }
}
