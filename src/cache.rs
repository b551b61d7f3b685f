//! Shared cache of remote resource values.
//!
//! One flat mapping from cache key to JSON value, with per-key change
//! notification and optional mirroring of a fixed key set to durable storage.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::storage::{NoopStorage, PersistentStorage};

/// Separator between the logical key and the service name in a cache key.
const KEY_SEPARATOR: &str = "@";

/// Derive the cache key for a logical key and a service name.
///
/// Also how entries of the persistence key set are spelled, so
/// `resource_key("temp", "fetch_profile")` names the same entry a
/// `Resource` built from key `"temp"` and that service would use.
pub fn resource_key(key: &str, service_name: &str) -> String {
  format!("{}{}{}", key, KEY_SEPARATOR, service_name)
}

/// Each entry is a watch channel; the channel holds the current value and
/// notifies subscribers on every write. Slots are created on first use and
/// survive `remove` so existing subscribers keep observing the key.
type Slot = watch::Sender<Option<Value>>;

struct CacheInner {
  entries: Mutex<HashMap<String, Slot>>,
  storage: Arc<dyn PersistentStorage>,
  persist_keys: HashSet<String>,
}

/// Shared cache of remote resource values.
///
/// Create one per application and pass clones to consumers; clones share the
/// same underlying state. The cache is the single source of truth for
/// resource data - handles returned by [`resource`](ResourceCache::resource)
/// are derived views over it.
#[derive(Clone)]
pub struct ResourceCache {
  inner: Arc<CacheInner>,
}

impl ResourceCache {
  /// Start building a cache with a storage backend and persistence key set.
  pub fn builder() -> ResourceCacheBuilder {
    ResourceCacheBuilder::default()
  }

  /// A cache with no durable storage and an empty persistence key set.
  pub fn in_memory() -> Self {
    Self::builder().build()
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
    // Recover from a poisoned lock; the map itself is always left consistent.
    self
      .inner
      .entries
      .lock()
      .unwrap_or_else(|e| e.into_inner())
  }

  fn slot(&self, key: &str) -> Slot {
    let mut entries = self.entries();
    entries
      .entry(key.to_string())
      .or_insert_with(|| watch::channel(None).0)
      .clone()
  }

  /// Snapshot of the current value for a key.
  pub fn get(&self, key: &str) -> Option<Value> {
    let entries = self.entries();
    entries.get(key).and_then(|slot| slot.borrow().clone())
  }

  /// Reactive view over a key.
  ///
  /// The receiver observes every subsequent write to the key, including
  /// writes that happen before the key holds its first value.
  pub fn subscribe(&self, key: &str) -> watch::Receiver<Option<Value>> {
    self.slot(key).subscribe()
  }

  /// Whether a key belongs to the persistence key set.
  pub fn is_persistent(&self, key: &str) -> bool {
    self.inner.persist_keys.contains(key)
  }

  /// Write a value into the cache, notifying subscribers.
  ///
  /// An empty key is a no-op. A durable write is scheduled only when
  /// `persist` is true and the key belongs to the persistence key set; keys
  /// outside the set never reach durable storage. The returned handle
  /// resolves when the durable write completes - await it for an
  /// acknowledgement, or drop it to leave the write running detached.
  pub fn save(
    &self,
    key: &str,
    value: Option<Value>,
    persist: bool,
  ) -> Option<JoinHandle<Result<()>>> {
    if key.is_empty() {
      debug!("ignoring save with empty key");
      return None;
    }

    let persist = persist && self.is_persistent(key);
    let stored = persist.then(|| value.clone().unwrap_or(Value::Null));
    self.slot(key).send_replace(value);

    let stored = stored?;
    let storage = Arc::clone(&self.inner.storage);
    let key = key.to_string();
    Some(tokio::task::spawn_blocking(move || {
      storage.store(&key, &stored)
    }))
  }

  /// Clear the value for a key, notifying subscribers.
  ///
  /// The entry's slot survives so existing subscribers keep observing the
  /// key; only its value is dropped. Does not touch durable storage.
  pub fn remove(&self, key: &str) {
    let entries = self.entries();
    if let Some(slot) = entries.get(key) {
      slot.send_replace(None);
      debug!("removed cache entry {}", key);
    }
  }

  /// Load every key of the persistence key set from durable storage into the
  /// cache.
  ///
  /// Keys are read concurrently with no ordering guarantee among them.
  /// Returns the number of keys that had a stored value; keys that fail to
  /// load are logged and skipped.
  pub async fn load_all_persisted(&self) -> Result<usize> {
    let tasks: Vec<_> = self
      .inner
      .persist_keys
      .iter()
      .cloned()
      .map(|key| {
        let storage = Arc::clone(&self.inner.storage);
        tokio::task::spawn_blocking(move || {
          let value = storage.load(&key);
          (key, value)
        })
      })
      .collect();

    let mut loaded = 0;
    for joined in futures::future::join_all(tasks).await {
      let (key, value) = joined.map_err(|e| eyre!("Storage load task failed: {}", e))?;
      match value {
        Ok(Some(value)) => {
          self.save(&key, Some(value), false);
          loaded += 1;
        }
        Ok(None) => {}
        Err(e) => warn!("failed to load persisted entry {}: {}", key, e),
      }
    }

    Ok(loaded)
  }
}

/// Builder for [`ResourceCache`].
pub struct ResourceCacheBuilder {
  storage: Arc<dyn PersistentStorage>,
  persist_keys: HashSet<String>,
}

impl Default for ResourceCacheBuilder {
  fn default() -> Self {
    Self {
      storage: Arc::new(NoopStorage),
      persist_keys: HashSet::new(),
    }
  }
}

impl ResourceCacheBuilder {
  /// Set the durable storage backend.
  pub fn storage(mut self, storage: Arc<dyn PersistentStorage>) -> Self {
    self.storage = storage;
    self
  }

  /// Add the entry for a logical key and service name to the persistence
  /// key set.
  pub fn persist(mut self, key: &str, service_name: &str) -> Self {
    self.persist_keys.insert(resource_key(key, service_name));
    self
  }

  /// Add an already-derived cache key to the persistence key set.
  pub fn persist_key(mut self, cache_key: impl Into<String>) -> Self {
    self.persist_keys.insert(cache_key.into());
    self
  }

  pub fn build(self) -> ResourceCache {
    ResourceCache {
      inner: Arc::new(CacheInner {
        entries: Mutex::new(HashMap::new()),
        storage: self.storage,
        persist_keys: self.persist_keys,
      }),
    }
  }
}
