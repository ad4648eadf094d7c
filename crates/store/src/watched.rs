//! Change-observing record container.
//!
//! The manifest's per-type record mappings are wrapped in [`WatchedMap`] so
//! the owning store can tell whether anything actually changed since the
//! last write. Inserting a value equal to the current one, removing an
//! absent key, and all reads leave the flag untouched.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::models::ExtensionRecord;

/// Ordered name-to-record mapping that notifies an owner on any structural
/// or value change.
///
/// Cloning detaches: a clone carries the contents but a fresh, unbound
/// flag, so mutating a snapshot never notifies the original owner.
#[derive(Debug, Default)]
pub struct WatchedMap {
    inner: BTreeMap<String, ExtensionRecord>,
    dirty: Arc<AtomicBool>,
}

impl Clone for WatchedMap {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl WatchedMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-point the change notification at `flag`. Called by the store
    /// after a manifest is parsed, since deserialized maps start unbound.
    pub(crate) fn bind(&mut self, flag: &Arc<AtomicBool>) {
        self.dirty = Arc::clone(flag);
    }

    /// Insert or replace a record. The owner is notified only when the new
    /// value differs from the current one. Returns the previous record.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        record: ExtensionRecord,
    ) -> Option<ExtensionRecord> {
        let name = name.into();
        let changed = self.inner.get(&name) != Some(&record);
        let previous = self.inner.insert(name, record);
        if changed {
            self.dirty.store(true, Ordering::SeqCst);
        }
        previous
    }

    /// Remove a record. The owner is notified only if the key was present.
    pub fn remove(&mut self, name: &str) -> Option<ExtensionRecord> {
        let previous = self.inner.remove(name);
        if previous.is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<&ExtensionRecord> {
        self.inner.get(name)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ExtensionRecord)> {
        self.inner.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.inner.keys()
    }

    /// Plain copy of the current contents.
    pub fn snapshot(&self) -> BTreeMap<String, ExtensionRecord> {
        self.inner.clone()
    }
}

impl PartialEq for WatchedMap {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl From<BTreeMap<String, ExtensionRecord>> for WatchedMap {
    fn from(inner: BTreeMap<String, ExtensionRecord>) -> Self {
        Self {
            inner,
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Serialize for WatchedMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.inner.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WatchedMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let inner = BTreeMap::deserialize(deserializer)?;
        Ok(Self::from(inner))
    }
}
