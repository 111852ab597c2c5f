//! Hydration merge.
//!
//! Reconciles a cache snapshot captured during a rendering pass with the cache
//! already held by a long-lived client:
//!
//! - maps merge key by key, recursively;
//! - lists become the existing list followed by every server entry that is not
//!   deep-equal to an existing entry;
//! - anywhere else the existing value wins.
//!
//! The merge is pure and idempotent: `merge(&merge(a, b), b) == merge(a, b)`.

use crate::cache::CacheSnapshot;
use serde_json::{Map, Value};

/// Merge a server-produced snapshot into the existing one.
pub fn merge(server: &CacheSnapshot, existing: &CacheSnapshot) -> CacheSnapshot {
    let mut merged = existing.entries().clone();
    for (key, server_fields) in server.entries() {
        let fields = match merged.remove(key) {
            Some(existing_fields) => merge_maps(server_fields, &existing_fields),
            None => server_fields.clone(),
        };
        merged.insert(key.clone(), fields);
    }
    CacheSnapshot::from_entries(merged)
}

/// Deep-merge two JSON values, `existing` taking precedence.
pub fn deep_merge(server: &Value, existing: &Value) -> Value {
    match (server, existing) {
        (Value::Object(s), Value::Object(e)) => Value::Object(merge_maps(s, e)),
        (Value::Array(s), Value::Array(e)) => Value::Array(union(s, e)),
        (_, existing) => existing.clone(),
    }
}

fn merge_maps(server: &Map<String, Value>, existing: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = existing.clone();
    for (key, server_value) in server {
        let value = match existing.get(key) {
            Some(existing_value) => deep_merge(server_value, existing_value),
            None => server_value.clone(),
        };
        merged.insert(key.clone(), value);
    }
    merged
}

fn union(server: &[Value], existing: &[Value]) -> Vec<Value> {
    let mut out = existing.to_vec();
    out.extend(
        server
            .iter()
            .filter(|candidate| !existing.contains(candidate))
            .cloned(),
    );
    out
}
