//! The referential data cache.
//!
//! Policies that cross-reference cluster state ("is another Service using
//! this selector?") read from this process-wide store during evaluation.
//! Entries mirror a controlled set of cluster objects, keyed by
//! (group, kind, namespace, name); the store is unbounded by design.
//!
//! Concurrency discipline: one `RwLock` guards both the primary map and the
//! per-(group, kind) index, so readers never observe the two out of sync.
//! Values are synthesized (and Arc-wrapped) before the write lock is taken;
//! the lock is held only for the pointer swap.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::target::ObjectRef;

/// Composite cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub group: String,
    pub kind: String,
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    pub name: String,
}

impl CacheKey {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derive the key for a decoded Kubernetes object.
    pub fn for_object(object: &Value) -> Option<Self> {
        let r = ObjectRef::from_object(object)?;
        if r.name.is_empty() {
            return None;
        }
        Some(Self {
            group: r.group,
            kind: r.kind,
            namespace: r.namespace,
            name: r.name,
        })
    }
}

#[derive(Default)]
struct Shard {
    /// Primary store.
    entries: HashMap<CacheKey, Arc<Value>>,
    /// (group, kind) → namespace → names, for O(result) listing.
    index: HashMap<(String, String), BTreeMap<String, Vec<String>>>,
}

impl Shard {
    fn index_insert(&mut self, key: &CacheKey) {
        let names = self
            .index
            .entry((key.group.clone(), key.kind.clone()))
            .or_default()
            .entry(key.namespace.clone())
            .or_default();
        if let Err(pos) = names.binary_search(&key.name) {
            names.insert(pos, key.name.clone());
        }
    }

    fn index_remove(&mut self, key: &CacheKey) {
        let gk = (key.group.clone(), key.kind.clone());
        if let Some(by_ns) = self.index.get_mut(&gk) {
            if let Some(names) = by_ns.get_mut(&key.namespace) {
                if let Ok(pos) = names.binary_search(&key.name) {
                    names.remove(pos);
                }
                if names.is_empty() {
                    by_ns.remove(&key.namespace);
                }
            }
            if by_ns.is_empty() {
                self.index.remove(&gk);
            }
        }
    }
}

/// Concurrent store of inventory objects consulted during evaluation.
#[derive(Default)]
pub struct ReferentialCache {
    shard: RwLock<Shard>,
}

impl ReferentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `object`'s key.
    ///
    /// Re-adding an existing key atomically replaces the prior value, so
    /// adding twice is indistinguishable from adding once.
    pub fn add(&self, key: CacheKey, object: Value) {
        // Build outside the lock; hold it only for the swap.
        let value = Arc::new(object);
        let mut shard = self.shard.write();
        let replaced = shard.entries.insert(key.clone(), value).is_some();
        if !replaced {
            shard.index_insert(&key);
        }
        log::debug!(
            "inventory: add {}/{} {}/{} ({} entries)",
            key.group,
            key.kind,
            key.namespace,
            key.name,
            shard.entries.len()
        );
    }

    /// Remove the entry for `key`. Removing an absent key is a no-op.
    pub fn remove(&self, key: &CacheKey) {
        let mut shard = self.shard.write();
        if shard.entries.remove(key).is_some() {
            shard.index_remove(key);
            log::debug!(
                "inventory: remove {}/{} {}/{} ({} entries)",
                key.group,
                key.kind,
                key.namespace,
                key.name,
                shard.entries.len()
            );
        }
    }

    /// Fetch a single entry.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Value>> {
        self.shard.read().entries.get(key).cloned()
    }

    /// List all entries of a (group, kind), optionally limited to one
    /// namespace. A miss is an empty list, never an error.
    pub fn list(&self, group: &str, kind: &str, namespace: Option<&str>) -> Vec<Arc<Value>> {
        let shard = self.shard.read();
        let Some(by_ns) = shard
            .index
            .get(&(group.to_string(), kind.to_string()))
        else {
            return Vec::new();
        };

        let mut out = Vec::new();
        match namespace {
            Some(ns) => {
                if let Some(names) = by_ns.get(ns) {
                    for name in names {
                        let key = CacheKey::new(group, kind, ns, name.clone());
                        if let Some(v) = shard.entries.get(&key) {
                            out.push(Arc::clone(v));
                        }
                    }
                }
            }
            None => {
                for (ns, names) in by_ns {
                    for name in names {
                        let key = CacheKey::new(group, kind, ns.clone(), name.clone());
                        if let Some(v) = shard.entries.get(&key) {
                            out.push(Arc::clone(v));
                        }
                    }
                }
            }
        }
        out
    }

    /// Number of cached entries, exposed as an observability metric.
    pub fn len(&self) -> usize {
        self.shard.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
