//! Object identity keys.

use crate::types::OperationKind;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Field holding a reference to another entry.
pub const REF_FIELD: &str = "__ref";
pub const TYPENAME_FIELD: &str = "__typename";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn root(kind: OperationKind) -> Self {
        Self::new(kind.root_key())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.starts_with("ROOT_")
    }

    /// `{"__ref": key}`
    pub fn to_reference(&self) -> Value {
        let mut map = Map::new();
        map.insert(REF_FIELD.to_string(), Value::String(self.0.clone()));
        Value::Object(map)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// The target key when `value` is a reference object.
pub fn reference_target(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(REF_FIELD).and_then(Value::as_str),
        _ => None,
    }
}

/// How objects of one type are identified.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyFields {
    /// `Type:id`, falling back to `_id`; objects without either are embedded.
    #[default]
    Default,
    /// `Type:{"field":value,...}` built from the listed fields, all required.
    Fields(Vec<String>),
    /// Never normalized; always embedded in the parent.
    Disabled,
}

/// Per-type identity rules.
#[derive(Debug, Clone, Default)]
pub struct TypePolicies {
    policies: HashMap<String, KeyFields>,
}

impl TypePolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_fields<I, S>(mut self, typename: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policies.insert(
            typename.into(),
            KeyFields::Fields(fields.into_iter().map(Into::into).collect()),
        );
        self
    }

    pub fn without_normalization(mut self, typename: impl Into<String>) -> Self {
        self.policies.insert(typename.into(), KeyFields::Disabled);
        self
    }

    pub fn key_fields(&self, typename: &str) -> &KeyFields {
        static DEFAULT: KeyFields = KeyFields::Default;
        self.policies.get(typename).unwrap_or(&DEFAULT)
    }

    /// Identity key of a response object, or `None` when it is embedded.
    ///
    /// `path` only feeds error context.
    pub fn identify(&self, object: &Map<String, Value>, path: &str) -> Result<Option<CacheKey>> {
        let Some(typename) = object.get(TYPENAME_FIELD).and_then(Value::as_str) else {
            return Ok(None);
        };
        match self.key_fields(typename) {
            KeyFields::Disabled => Ok(None),
            KeyFields::Default => Ok(["id", "_id"]
                .iter()
                .find_map(|f| object.get(*f).and_then(scalar_id))
                .map(|id| CacheKey::new(format!("{}:{}", typename, id)))),
            KeyFields::Fields(fields) => {
                let mut parts = Vec::with_capacity(fields.len());
                for field in fields {
                    let value = object.get(field).filter(|v| !v.is_null()).ok_or_else(|| {
                        Error::normalization_with_context(
                            format!("missing key field '{}' on {}", field, typename),
                            ErrorContext::new()
                                .with_field_path(path)
                                .with_details(format!("key fields: {}", fields.join(", ")))
                                .with_source("type_policies"),
                        )
                    })?;
                    parts.push(format!(
                        "{}:{}",
                        Value::String(field.clone()),
                        serde_json::to_string(value)?
                    ));
                }
                Ok(Some(CacheKey::new(format!("{}:{{{}}}", typename, parts.join(",")))))
            }
        }
    }
}

fn scalar_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
