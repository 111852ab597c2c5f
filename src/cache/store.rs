//! Normalized cache store.

use super::key::{reference_target, CacheKey, TypePolicies};
use super::snapshot::{first_dangling, CacheSnapshot};
use crate::hydration;
use crate::types::OperationKind;
use crate::{Error, ErrorContext, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

type Entries = HashMap<String, Map<String, Value>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Responses committed to the store.
    pub writes: u64,
    /// Responses that failed normalization and left the store untouched.
    pub rejected_writes: u64,
    pub reads: u64,
    pub hits: u64,
    pub misses: u64,
    pub restores: u64,
    /// Snapshots merged into the live contents.
    pub hydrations: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    writes: AtomicU64,
    rejected_writes: AtomicU64,
    reads: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    restores: AtomicU64,
    hydrations: AtomicU64,
}

impl AtomicStats {
    fn record_read(&self, hit: bool) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn to_stats(&self) -> CacheStats {
        CacheStats {
            writes: self.writes.load(Ordering::Relaxed),
            rejected_writes: self.rejected_writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            restores: self.restores.load(Ordering::Relaxed),
            hydrations: self.hydrations.load(Ordering::Relaxed),
        }
    }
}

/// Collects the entries produced by one response before anything is applied.
struct Normalizer<'a> {
    policies: &'a TypePolicies,
    staged: Entries,
}

impl<'a> Normalizer<'a> {
    fn new(policies: &'a TypePolicies) -> Self {
        Self {
            policies,
            staged: Entries::new(),
        }
    }

    fn stage(&mut self, key: String, fields: Map<String, Value>) {
        let entry = self.staged.entry(key).or_default();
        for (field, value) in fields {
            entry.insert(field, value);
        }
    }

    fn normalize(&mut self, value: &Value, path: &str) -> Result<Value> {
        match value {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.normalize(item, &format!("{}.{}", path, i)))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(object) => {
                let mut fields = Map::new();
                for (name, field) in object {
                    let normalized = self.normalize(field, &format!("{}.{}", path, name))?;
                    fields.insert(name.clone(), normalized);
                }
                match self.policies.identify(object, path)? {
                    Some(key) => {
                        let reference = key.to_reference();
                        self.stage(key.into_string(), fields);
                        Ok(reference)
                    }
                    None => Ok(Value::Object(fields)),
                }
            }
            scalar => Ok(scalar.clone()),
        }
    }
}

/// Identity-keyed store of the latest known field values per object.
///
/// Every reference held by an entry resolves to an entry of the same store:
/// writes are staged and validated before anything is applied.
#[derive(Default)]
pub struct NormalizedStore {
    entries: RwLock<Entries>,
    policies: TypePolicies,
    stats: AtomicStats,
}

impl NormalizedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies(policies: TypePolicies) -> Self {
        Self {
            policies,
            ..Self::default()
        }
    }

    pub fn policies(&self) -> &TypePolicies {
        &self.policies
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Normalize a response's `data` under the root entry for `kind`.
    ///
    /// All-or-nothing: on error the store is unchanged. Existing entries are
    /// merged field by field.
    pub fn write_result(&self, kind: OperationKind, data: &Value) -> Result<()> {
        let result = self.try_write(kind, data);
        if result.is_err() {
            self.stats.rejected_writes.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn try_write(&self, kind: OperationKind, data: &Value) -> Result<()> {
        let Value::Object(root) = data else {
            return Err(Error::normalization_with_context(
                "response data must be an object",
                ErrorContext::new()
                    .with_field_path("data")
                    .with_source("normalizer"),
            ));
        };

        let mut normalizer = Normalizer::new(&self.policies);
        let mut root_fields = Map::new();
        for (name, value) in root {
            let normalized = normalizer.normalize(value, &format!("data.{}", name))?;
            root_fields.insert(name.clone(), normalized);
        }
        normalizer.stage(kind.root_key().to_string(), root_fields);
        let staged = normalizer.staged;

        let mut entries = self.write_guard();
        for (key, fields) in &staged {
            for (field, value) in fields {
                let exists = |k: &str| staged.contains_key(k) || entries.contains_key(k);
                if let Some(target) = first_dangling(value, &exists) {
                    return Err(Error::normalization_with_context(
                        format!("reference to unknown entry '{}'", target),
                        ErrorContext::new()
                            .with_field_path(format!("{}.{}", key, field))
                            .with_source("normalizer"),
                    ));
                }
            }
        }

        let touched = staged.len();
        for (key, fields) in staged {
            let entry = entries.entry(key).or_default();
            for (field, value) in fields {
                entry.insert(field, value);
            }
        }
        drop(entries);

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        debug!(root = kind.root_key(), entries = touched, "normalized response");
        Ok(())
    }

    /// Raw entry, references left in place.
    pub fn get(&self, key: &str) -> Option<Map<String, Value>> {
        let entry = self.read_guard().get(key).cloned();
        self.stats.record_read(entry.is_some());
        entry
    }

    /// Entry with references expanded. A reference back to an entry already
    /// being expanded is left as a reference.
    pub fn resolve(&self, key: &str) -> Option<Value> {
        let entries = self.read_guard();
        let resolved = entries.get(key).map(|entry| {
            let mut visiting = vec![key.to_string()];
            denormalize_fields(&entries, entry, &mut visiting)
        });
        self.stats.record_read(resolved.is_some());
        resolved
    }

    /// Expanded root fields for `kind`; `None` unless every field in
    /// `required` is held. Fields in `optional` are included when present.
    pub fn read_root(
        &self,
        kind: OperationKind,
        required: &[String],
        optional: &[String],
    ) -> Option<Map<String, Value>> {
        let entries = self.read_guard();
        let result = entries.get(kind.root_key()).and_then(|root| {
            let mut out = Map::new();
            let mut expand = |field: &String, value: &Value| {
                let mut visiting = vec![kind.root_key().to_string()];
                out.insert(field.clone(), denormalize(&entries, value, &mut visiting));
            };
            for field in required {
                expand(field, root.get(field)?);
            }
            for field in optional {
                if let Some(value) = root.get(field) {
                    expand(field, value);
                }
            }
            Some(out)
        });
        self.stats.record_read(result.is_some());
        result
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read_guard().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_guard().is_empty()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.read_guard().keys().cloned().map(CacheKey::new).collect();
        keys.sort();
        keys
    }

    pub fn extract(&self) -> CacheSnapshot {
        CacheSnapshot::from_entries(
            self.read_guard()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Replace the whole store with `snapshot`, which must be self-consistent.
    pub fn restore(&self, snapshot: CacheSnapshot) -> Result<()> {
        snapshot.validate()?;
        let restored: Entries = snapshot.into_entries().into_iter().collect();
        let count = restored.len();
        *self.write_guard() = restored;
        self.stats.restores.fetch_add(1, Ordering::Relaxed);
        debug!(entries = count, "cache restored");
        Ok(())
    }

    /// Merge `server` into the current contents (see [`hydration::merge`]).
    ///
    /// Read, merge and swap happen under one write lock, so a response
    /// committed concurrently is either part of the merge input or applied
    /// after it. On error the store is unchanged. Returns the entry count.
    pub fn hydrate(&self, server: &CacheSnapshot) -> Result<usize> {
        let mut entries = self.write_guard();
        let existing = CacheSnapshot::from_entries(
            entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        );
        let merged = hydration::merge(server, &existing);
        merged.validate()?;
        let count = merged.len();
        *entries = merged.into_entries().into_iter().collect();
        drop(entries);

        self.stats.hydrations.fetch_add(1, Ordering::Relaxed);
        debug!(server_entries = server.len(), entries = count, "cache hydrated");
        Ok(count)
    }

    pub fn clear(&self) {
        self.write_guard().clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }
}

fn denormalize_fields(
    entries: &Entries,
    fields: &Map<String, Value>,
    visiting: &mut Vec<String>,
) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), denormalize(entries, v, visiting)))
            .collect(),
    )
}

fn denormalize(entries: &Entries, value: &Value, visiting: &mut Vec<String>) -> Value {
    if let Some(target) = reference_target(value) {
        if visiting.iter().any(|k| k == target) {
            return value.clone();
        }
        return match entries.get(target) {
            Some(entry) => {
                visiting.push(target.to_string());
                let expanded = denormalize_fields(entries, entry, visiting);
                visiting.pop();
                expanded
            }
            None => value.clone(),
        };
    }
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| denormalize(entries, item, visiting))
                .collect(),
        ),
        Value::Object(map) => denormalize_fields(entries, map, visiting),
        scalar => scalar.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn writes_normalize_by_identity() {
        let store = NormalizedStore::new();
        store
            .write_result(
                OperationKind::Query,
                &json!({
                    "me": {"__typename": "User", "id": "1", "name": "Ada"},
                    "feed": [
                        {"__typename": "Post", "id": 10, "author": {"__typename": "User", "id": "1"}},
                    ]
                }),
            )
            .unwrap();

        assert_eq!(
            store.get("ROOT_QUERY").unwrap()["me"],
            json!({"__ref": "User:1"})
        );
        assert_eq!(
            store.get("Post:10").unwrap()["author"],
            json!({"__ref": "User:1"})
        );
        let user = store.get("User:1").unwrap();
        assert_eq!(user["name"], "Ada");
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn entries_merge_field_by_field() {
        let store = NormalizedStore::new();
        store
            .write_result(
                OperationKind::Query,
                &json!({"me": {"__typename": "User", "id": 1, "name": "Ada", "email": "a@x"}}),
            )
            .unwrap();
        store
            .write_result(
                OperationKind::Query,
                &json!({"user": {"__typename": "User", "id": 1, "name": "Ada L."}}),
            )
            .unwrap();

        let user = store.get("User:1").unwrap();
        assert_eq!(user["name"], "Ada L.");
        assert_eq!(user["email"], "a@x");
        let root = store.get("ROOT_QUERY").unwrap();
        assert!(root.contains_key("me") && root.contains_key("user"));
    }

    #[test]
    fn failed_normalization_leaves_store_unchanged() {
        let store = NormalizedStore::with_policies(
            TypePolicies::new().with_key_fields("Book", ["isbn"]),
        );
        store
            .write_result(OperationKind::Query, &json!({"count": 1}))
            .unwrap();
        let before = store.extract();

        let err = store
            .write_result(
                OperationKind::Query,
                &json!({
                    "me": {"__typename": "User", "id": 2, "name": "Grace"},
                    "book": {"__typename": "Book", "title": "no isbn"}
                }),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Normalization { .. }));
        assert_eq!(store.extract(), before);
        assert!(!store.contains("User:2"));

        assert!(store
            .write_result(OperationKind::Query, &json!([1, 2]))
            .is_err());
        let stats = store.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.rejected_writes, 2);
    }

    #[test]
    fn read_root_expands_references_and_survives_cycles() {
        let store = NormalizedStore::new();
        store
            .write_result(
                OperationKind::Query,
                &json!({
                    "me": {
                        "__typename": "User", "id": 1,
                        "bestFriend": {"__typename": "User", "id": 2,
                            "bestFriend": {"__typename": "User", "id": 1}}
                    }
                }),
            )
            .unwrap();

        let data = store
            .read_root(OperationKind::Query, &fields(&["me"]), &[])
            .unwrap();
        assert_eq!(data["me"]["bestFriend"]["id"], 2);
        assert_eq!(
            data["me"]["bestFriend"]["bestFriend"],
            json!({"__ref": "User:1"})
        );

        assert!(store
            .read_root(OperationKind::Query, &fields(&["me", "missing"]), &[])
            .is_none());
        let partial = store
            .read_root(OperationKind::Query, &fields(&["me"]), &fields(&["missing"]))
            .unwrap();
        assert!(partial.contains_key("me") && !partial.contains_key("missing"));
        let stats = store.stats();
        assert_eq!((stats.hits, stats.misses), (2, 1));
    }

    #[test]
    fn resolve_expands_one_entry() {
        let store = NormalizedStore::new();
        store
            .write_result(
                OperationKind::Query,
                &json!({"post": {"__typename": "Post", "id": 1,
                    "author": {"__typename": "User", "id": 9, "name": "Lin"}}}),
            )
            .unwrap();
        assert_eq!(store.resolve("Post:1").unwrap()["author"]["name"], "Lin");
        assert!(store.resolve("Post:2").is_none());
    }

    #[test]
    fn restore_rejects_inconsistent_snapshots() {
        let store = NormalizedStore::new();
        store
            .write_result(OperationKind::Query, &json!({"a": 1}))
            .unwrap();

        let dangling = CacheSnapshot::from_value(json!({
            "ROOT_QUERY": {"me": {"__ref": "User:1"}}
        }))
        .unwrap();
        assert!(store.restore(dangling).is_err());
        assert_eq!(store.get("ROOT_QUERY").unwrap()["a"], 1);

        let good = CacheSnapshot::from_value(json!({
            "ROOT_QUERY": {"me": {"__ref": "User:1"}},
            "User:1": {"id": 1}
        }))
        .unwrap();
        store.restore(good.clone()).unwrap();
        assert_eq!(store.extract(), good);
        assert_eq!(store.stats().restores, 1);
    }

    #[test]
    fn hydrate_merges_in_place() {
        let store = NormalizedStore::new();
        store
            .write_result(
                OperationKind::Query,
                &json!({"me": {"__typename": "User", "id": 1, "name": "live"}}),
            )
            .unwrap();

        let server = CacheSnapshot::from_value(json!({
            "ROOT_QUERY": {"feed": [{"__ref": "Post:1"}]},
            "User:1": {"__typename": "User", "id": 1, "name": "rendered"},
            "Post:1": {"id": 1}
        }))
        .unwrap();
        assert_eq!(store.hydrate(&server).unwrap(), 3);
        assert_eq!(store.get("User:1").unwrap()["name"], "live");
        let root = store.get("ROOT_QUERY").unwrap();
        assert!(root.contains_key("me") && root.contains_key("feed"));

        let dangling = CacheSnapshot::from_value(json!({
            "ROOT_QUERY": {"viewer": {"__ref": "User:404"}}
        }))
        .unwrap();
        let before = store.extract();
        assert!(store.hydrate(&dangling).is_err());
        assert_eq!(store.extract(), before);
        assert_eq!(store.stats().hydrations, 1);
    }

    #[test]
    fn hydrate_keeps_concurrent_writes() {
        let store = std::sync::Arc::new(NormalizedStore::new());
        let server = CacheSnapshot::from_value(json!({
            "ROOT_QUERY": {"banner": "hello"}
        }))
        .unwrap();

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for n in 0..500 {
                    store
                        .write_result(
                            OperationKind::Query,
                            &json!({ format!("item{}", n): {"__typename": "Item", "id": n} }),
                        )
                        .unwrap();
                }
            })
        };
        for _ in 0..500 {
            store.hydrate(&server).unwrap();
        }
        writer.join().unwrap();

        for n in 0..500 {
            assert!(store.contains(&format!("Item:{}", n)), "Item:{} lost", n);
        }
    }

    #[test]
    fn mutations_write_under_their_own_root() {
        let store = NormalizedStore::new();
        store
            .write_result(
                OperationKind::Mutation,
                &json!({"rename": {"__typename": "User", "id": 1, "name": "New"}}),
            )
            .unwrap();
        assert!(store.contains("ROOT_MUTATION"));
        assert!(!store.contains("ROOT_QUERY"));
        assert_eq!(store.get("User:1").unwrap()["name"], "New");
    }
}
