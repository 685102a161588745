//! Object cache
//!
//! In-memory snapshots of model objects, keyed by primary key.
//!
//! Entries are replaced wholesale on every refresh, never patched field by
//! field, so an entry always reflects one complete read of the object.

use crate::hooks::ObjectId;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Property name -> value for one object.
pub type CachedObject = BTreeMap<String, Value>;

/// Every model's cache, keyed by model name. Published on each change.
pub type CacheSnapshot = BTreeMap<String, ObjectCache>;

/// Cache for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ObjectCache {
    entries: BTreeMap<ObjectId, CachedObject>,
}

impl ObjectCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: ObjectId) -> Option<&CachedObject> {
        self.entries.get(&key)
    }

    /// Replace the entry for `key`, returning the previous one.
    pub fn insert(&mut self, key: ObjectId, object: CachedObject) -> Option<CachedObject> {
        self.entries.insert(key, object)
    }

    pub fn remove(&mut self, key: ObjectId) -> Option<CachedObject> {
        self.entries.remove(&key)
    }

    pub fn contains(&self, key: ObjectId) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
