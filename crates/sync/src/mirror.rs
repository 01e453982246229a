//! In-memory cache of the watched collection's current members.
//!
//! Mutated by the watch source's callbacks, read by the sync loop; the
//! handles clone cheaply and share one map. A key write dequeued later
//! always sees the freshest entry, so ordering is latest-wins per key.

use std::sync::{Arc, PoisonError, RwLock};

use rustc_hash::FxHashMap;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct MirrorEntry {
    /// Change-version token from the source; equal tokens mean no change.
    pub resource_version: String,
    pub value: Value,
}

#[derive(Clone, Default)]
pub struct Mirror {
    inner: Arc<RwLock<FxHashMap<String, MirrorEntry>>>,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite one entry. Returns `false` when the existing
    /// entry carries the same change-version token, which suppresses echo
    /// from periodic relists.
    pub fn upsert(&self, key: &str, resource_version: &str, value: Value) -> bool {
        let mut map = self.write();
        if let Some(existing) = map.get(key) {
            if existing.resource_version == resource_version {
                return false;
            }
        }
        map.insert(
            key.to_string(),
            MirrorEntry {
                resource_version: resource_version.to_string(),
                value,
            },
        );
        true
    }

    /// Remove one entry; `false` when the key was not tracked.
    pub fn remove(&self, key: &str) -> bool {
        self.write().remove(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).map(|e| e.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Replace the whole cache with a relisted set.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = (String, MirrorEntry)>) {
        let mut map = self.write();
        map.clear();
        map.extend(entries);
    }

    /// Current contents as `(key, value)` pairs.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.read()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, FxHashMap<String, MirrorEntry>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, FxHashMap<String, MirrorEntry>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upsert_reports_version_changes() {
        let m = Mirror::new();
        assert!(m.upsert("ns1/a", "1", json!({"x": 1})));
        assert!(!m.upsert("ns1/a", "1", json!({"x": 1})));
        assert!(m.upsert("ns1/a", "2", json!({"x": 2})));
        assert_eq!(m.get("ns1/a"), Some(json!({"x": 2})));
    }

    #[test]
    fn remove_reports_presence() {
        let m = Mirror::new();
        m.upsert("a", "1", json!(1));
        assert!(m.remove("a"));
        assert!(!m.remove("a"));
        assert!(m.is_empty());
    }

    #[test]
    fn replace_all_swaps_contents() {
        let m = Mirror::new();
        m.upsert("gone", "1", json!(1));
        m.replace_all(vec![(
            "kept".to_string(),
            MirrorEntry {
                resource_version: "2".to_string(),
                value: json!(2),
            },
        )]);
        assert!(!m.contains("gone"));
        assert_eq!(m.get("kept"), Some(json!(2)));
        assert_eq!(m.len(), 1);
    }
}
