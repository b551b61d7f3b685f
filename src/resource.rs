//! Per-consumer resource binding over the shared cache.
//!
//! A `Resource<S>` ties one cache entry to one service: it derives the cache
//! key from a logical key and the service's name, tracks loading and error
//! state around service calls, and writes results back into the shared cache.
//!
//! # Example
//!
//! ```ignore
//! let cache = ResourceCache::in_memory();
//! let fetch_users = service_fn("fetch_users", |params: Value| async move {
//!     client.users(params).await
//! });
//!
//! let mut users = cache.resource(
//!     "list",
//!     fetch_users,
//!     json!({"page": 0}),
//!     ResourceOptions::default(),
//! );
//!
//! // The initial fetch runs on the runtime; await it if you need the data now.
//! if let Some(load) = users.initial_load() {
//!     load.await?;
//! }
//!
//! match users.data() {
//!     Some(list) => render(list),
//!     None if users.is_loading() => render_spinner(),
//!     None => render_error(users.error()),
//! }
//!
//! // Next page, appended to the cached list.
//! users.load_more().await;
//! ```

use color_eyre::Result;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::{resource_key, ResourceCache};
use crate::traits::{next_page_params, Merge, Paged, Service};

/// Configuration for a [`Resource`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceOptions {
  /// Clear the cache entry when the handle is dropped.
  pub clean_after: bool,
  /// Skip the automatic initial fetch.
  pub no_fetch: bool,
}

/// State shared between the handle and its spawned fetches.
struct ResourceState<S: Service> {
  cache: ResourceCache,
  service: S,
  key: String,
  persist: bool,
  loading: AtomicBool,
  error: Mutex<Option<String>>,
}

impl<S: Service> ResourceState<S> {
  /// Run the service call with loading set around it.
  ///
  /// On failure the error is recorded and `None` is returned; nothing
  /// propagates to the caller.
  async fn fetch(&self, params: S::Params) -> Option<S::Output> {
    self.loading.store(true, Ordering::SeqCst);
    let result = self.service.call(params).await;
    self.loading.store(false, Ordering::SeqCst);

    match result {
      Ok(data) => Some(data),
      Err(err) => {
        self.record_error(err.to_string());
        None
      }
    }
  }

  fn record_error(&self, err: String) {
    let mut slot = self.error.lock().unwrap_or_else(|e| e.into_inner());
    *slot = Some(err);
  }

  fn serialize(&self, data: S::Output) -> Option<Value> {
    match serde_json::to_value(data) {
      Ok(value) => Some(value),
      Err(err) => {
        self.record_error(format!("Failed to serialize resource data: {}", err));
        None
      }
    }
  }

  fn save(&self, value: Option<Value>) -> Option<JoinHandle<Result<()>>> {
    self.cache.save(&self.key, value, self.persist)
  }

  /// Fetch and store the result, success or not. A failed fetch writes an
  /// empty value, clearing whatever the entry held before.
  async fn reload(&self, params: S::Params) -> Option<JoinHandle<Result<()>>> {
    let value = match self.fetch(params).await {
      Some(data) => self.serialize(data),
      None => None,
    };
    self.save(value)
  }
}

/// Reactive handle over one cached remote resource.
///
/// Obtained from [`ResourceCache::resource`]. The cache stays the single
/// source of truth; the handle's data view is derived from it and consumers
/// must treat it as read-only, going through [`set_data`](Resource::set_data)
/// or the reload operations to change it.
///
/// Dropping the handle does not cancel an in-flight service call; with
/// `clean_after` set, a late resolution may overwrite the cleared entry.
pub struct Resource<S: Service> {
  state: Arc<ResourceState<S>>,
  params: S::Params,
  rx: watch::Receiver<Option<Value>>,
  clean_after: bool,
  initial_load: Option<JoinHandle<()>>,
}

impl ResourceCache {
  /// Bind a resource handle for a logical key and service.
  ///
  /// The cache key is `{key}@{service_name}`. Unless the entry already holds
  /// a value or `no_fetch` is set, an initial [`reload`](Resource::reload) is
  /// spawned on the runtime; its handle is available through
  /// [`initial_load`](Resource::initial_load).
  pub fn resource<S: Service>(
    &self,
    key: &str,
    service: S,
    params: S::Params,
    options: ResourceOptions,
  ) -> Resource<S> {
    let key = resource_key(key, service.name());
    let persist = self.is_persistent(&key);
    let rx = self.subscribe(&key);

    let state = Arc::new(ResourceState {
      cache: self.clone(),
      service,
      key,
      persist,
      loading: AtomicBool::new(false),
      error: Mutex::new(None),
    });

    let initial_load = if self.get(&state.key).is_none() && !options.no_fetch {
      let state = Arc::clone(&state);
      let params = params.clone();
      Some(tokio::spawn(async move {
        state.reload(params).await;
      }))
    } else {
      None
    };

    Resource {
      state,
      params,
      rx,
      clean_after: options.clean_after,
      initial_load,
    }
  }
}

impl<S: Service> Resource<S> {
  /// The derived cache key this handle is bound to.
  pub fn key(&self) -> &str {
    &self.state.key
  }

  /// True while a service call is in flight, false otherwise (including
  /// after a failure).
  pub fn is_loading(&self) -> bool {
    self.state.loading.load(Ordering::SeqCst)
  }

  /// The most recent service error.
  ///
  /// Not cleared by a later successful fetch; stays set until the next
  /// failure replaces it.
  pub fn error(&self) -> Option<String> {
    let slot = self.state.error.lock().unwrap_or_else(|e| e.into_inner());
    slot.clone()
  }

  /// Typed snapshot of the current cache entry.
  ///
  /// Returns `None` when the entry is empty or does not deserialize as
  /// `S::Output` (another binding may have stored a different shape under
  /// the same key).
  pub fn data(&self) -> Option<S::Output> {
    let value = self.rx.borrow().clone()?;
    serde_json::from_value(value).ok()
  }

  /// Reactive view over the cache entry; observes every write to the key.
  pub fn subscribe(&self) -> watch::Receiver<Option<Value>> {
    self.rx.clone()
  }

  /// Wait until the cache entry changes.
  pub async fn changed(&mut self) -> Result<()> {
    self.rx.changed().await?;
    Ok(())
  }

  /// Handle of the automatic initial fetch, if one was spawned.
  ///
  /// Awaiting it guarantees the first reload (and its cache write) has
  /// finished. Can only be taken once.
  pub fn initial_load(&mut self) -> Option<JoinHandle<()>> {
    self.initial_load.take()
  }

  /// Re-run the service with the constructor parameters and store the
  /// outcome.
  ///
  /// Service failures do not propagate: the error is recorded on the handle
  /// and an empty value is written, replacing any previously cached data.
  /// The returned handle, when present, resolves once the durable write for
  /// a persisted key completes.
  pub async fn reload(&self) -> Option<JoinHandle<Result<()>>> {
    self.state.reload(self.params.clone()).await
  }

  /// [`reload`](Resource::reload) with different parameters.
  pub async fn reload_with(&self, params: S::Params) -> Option<JoinHandle<Result<()>>> {
    self.state.reload(params).await
  }

  /// Write data directly into the cache entry, bypassing the service.
  pub fn set_data(&self, data: S::Output) -> Option<JoinHandle<Result<()>>> {
    match self.state.serialize(data) {
      Some(value) => self.state.save(Some(value)),
      None => None,
    }
  }

  /// Fetch the next page and append it to the cached value.
  ///
  /// Page parameters are derived from the constructor parameters by
  /// incrementing their page field; parameters without one are used
  /// unchanged (a warning is logged, the fetch still happens). The fetched
  /// page is merged into the existing value by concatenation.
  pub async fn load_more(&self) -> Option<JoinHandle<Result<()>>>
  where
    S::Params: Paged,
    S::Output: Merge,
  {
    self.load_more_with(None, Merge::merge).await
  }

  /// [`load_more`](Resource::load_more) with explicit parameters and merge
  /// function.
  ///
  /// `params` falls back to the constructor parameters. On a failed fetch
  /// the error is recorded and the cached value is left as it was; pages
  /// already loaded survive.
  pub async fn load_more_with<F>(
    &self,
    params: Option<S::Params>,
    merge: F,
  ) -> Option<JoinHandle<Result<()>>>
  where
    S::Params: Paged,
    F: FnOnce(S::Output, S::Output) -> S::Output,
  {
    let params = next_page_params(params.unwrap_or_else(|| self.params.clone()));

    let next = match self.state.fetch(params).await {
      Some(data) => data,
      None => return None,
    };

    let merged = match self.data() {
      Some(previous) => merge(previous, next),
      None => next,
    };

    match self.state.serialize(merged) {
      Some(value) => self.state.save(Some(value)),
      None => None,
    }
  }
}

impl<S: Service> Drop for Resource<S> {
  fn drop(&mut self) {
    if self.clean_after {
      self.state.cache.remove(&self.state.key);
    }
  }
}

impl<S: Service> std::fmt::Debug for Resource<S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Resource")
      .field("key", &self.state.key)
      .field("persist", &self.state.persist)
      .field("loading", &self.is_loading())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::resource_key;
  use crate::storage::{MemoryStorage, PersistentStorage};
  use crate::traits::service_fn;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::atomic::AtomicU32;

  /// Service that records every params it was called with and pages through
  /// a fixed user list: page 0 -> [a, b], later pages -> [c, d].
  fn paged_users(
    calls: Arc<Mutex<Vec<Value>>>,
  ) -> impl Service<Params = Value, Output = Vec<String>> {
    service_fn("fetch_users", move |params: Value| {
      let calls = calls.clone();
      async move {
        calls.lock().unwrap().push(params.clone());
        let page = params.get("page").and_then(Value::as_u64).unwrap_or(0);
        let users = if page == 0 {
          vec!["a".to_string(), "b".to_string()]
        } else {
          vec!["c".to_string(), "d".to_string()]
        };
        Ok(users)
      }
    })
  }

  #[tokio::test]
  async fn test_initial_fetch_populates_cache() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let cache = ResourceCache::in_memory();

    let mut users = cache.resource(
      "list",
      paged_users(calls.clone()),
      json!({"page": 0}),
      ResourceOptions::default(),
    );

    users.initial_load().expect("initial fetch spawned").await.unwrap();

    assert_eq!(*calls.lock().unwrap(), vec![json!({"page": 0})]);
    assert_eq!(users.data(), Some(vec!["a".to_string(), "b".to_string()]));
    assert_eq!(
      cache.get(&resource_key("list", "fetch_users")),
      Some(json!(["a", "b"]))
    );
    assert!(!users.is_loading());
    assert_eq!(users.error(), None);
  }

  #[tokio::test]
  async fn test_load_more_appends_next_page() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let cache = ResourceCache::in_memory();

    let mut users = cache.resource(
      "list",
      paged_users(calls.clone()),
      json!({"page": 0}),
      ResourceOptions::default(),
    );
    users.initial_load().unwrap().await.unwrap();

    users.load_more().await;

    assert_eq!(
      *calls.lock().unwrap(),
      vec![json!({"page": 0}), json!({"page": 1})]
    );
    assert_eq!(
      users.data(),
      Some(vec![
        "a".to_string(),
        "b".to_string(),
        "c".to_string(),
        "d".to_string()
      ])
    );
  }

  #[tokio::test]
  async fn test_load_more_without_page_field_uses_params_unchanged() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let cache = ResourceCache::in_memory();

    let users = cache.resource(
      "list",
      paged_users(calls.clone()),
      json!({"q": "abc"}),
      ResourceOptions {
        no_fetch: true,
        ..Default::default()
      },
    );

    users.load_more().await;

    // Fetch still happened, with the original params.
    assert_eq!(*calls.lock().unwrap(), vec![json!({"q": "abc"})]);
    assert_eq!(users.data(), Some(vec!["a".to_string(), "b".to_string()]));
  }

  #[tokio::test]
  async fn test_failed_reload_overwrites_cache() {
    let cache = ResourceCache::in_memory();
    let failing = service_fn("fetch_users", |_params: Value| async move {
      Err::<Vec<String>, _>(eyre!("service unavailable"))
    });

    let users = cache.resource(
      "list",
      failing,
      json!({"page": 0}),
      ResourceOptions {
        no_fetch: true,
        ..Default::default()
      },
    );
    users.set_data(vec!["a".to_string()]);
    assert!(users.data().is_some());

    users.reload().await;

    assert!(!users.is_loading());
    assert!(users.error().unwrap().contains("service unavailable"));
    // The failed fetch replaced the previously cached value.
    assert_eq!(users.data(), None);
    assert_eq!(cache.get(users.key()), None);
  }

  #[tokio::test]
  async fn test_failed_load_more_keeps_cached_pages() {
    let cache = ResourceCache::in_memory();
    let failing = service_fn("fetch_users", |_params: Value| async move {
      Err::<Vec<String>, _>(eyre!("service unavailable"))
    });

    let users = cache.resource(
      "list",
      failing,
      json!({"page": 0}),
      ResourceOptions {
        no_fetch: true,
        ..Default::default()
      },
    );
    users.set_data(vec!["a".to_string(), "b".to_string()]);

    users.load_more().await;

    assert!(users.error().is_some());
    assert_eq!(users.data(), Some(vec!["a".to_string(), "b".to_string()]));
  }

  #[tokio::test]
  async fn test_error_survives_later_success() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();
    let flaky = service_fn("fetch_count", move |_params: Value| {
      let attempts = attempts_clone.clone();
      async move {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
          Err(eyre!("first attempt failed"))
        } else {
          Ok(7u32)
        }
      }
    });

    let cache = ResourceCache::in_memory();
    let counter = cache.resource(
      "count",
      flaky,
      json!({}),
      ResourceOptions {
        no_fetch: true,
        ..Default::default()
      },
    );

    counter.reload().await;
    assert!(counter.error().is_some());

    counter.reload().await;
    assert_eq!(counter.data(), Some(7));
    // The recorded error is not cleared by the successful fetch.
    assert!(counter.error().unwrap().contains("first attempt failed"));
  }

  #[tokio::test]
  async fn test_no_fetch_skips_initial_load() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let cache = ResourceCache::in_memory();

    let mut users = cache.resource(
      "list",
      paged_users(calls.clone()),
      json!({"page": 0}),
      ResourceOptions {
        no_fetch: true,
        ..Default::default()
      },
    );

    assert!(users.initial_load().is_none());
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert!(calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_cached_value_skips_initial_load() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let cache = ResourceCache::in_memory();
    cache.save(
      &resource_key("list", "fetch_users"),
      Some(json!(["x"])),
      false,
    );

    let mut users = cache.resource(
      "list",
      paged_users(calls.clone()),
      json!({"page": 0}),
      ResourceOptions::default(),
    );

    assert!(users.initial_load().is_none());
    assert_eq!(users.data(), Some(vec!["x".to_string()]));
  }

  #[tokio::test]
  async fn test_set_data_bypasses_service() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let cache = ResourceCache::in_memory();

    let users = cache.resource(
      "list",
      paged_users(calls.clone()),
      json!({"page": 0}),
      ResourceOptions {
        no_fetch: true,
        ..Default::default()
      },
    );

    users.set_data(vec!["manual".to_string()]);

    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(users.data(), Some(vec!["manual".to_string()]));
  }

  #[tokio::test]
  async fn test_reload_with_overrides_params() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let cache = ResourceCache::in_memory();

    let users = cache.resource(
      "list",
      paged_users(calls.clone()),
      json!({"page": 0}),
      ResourceOptions {
        no_fetch: true,
        ..Default::default()
      },
    );

    users.reload_with(json!({"page": 5})).await;

    assert_eq!(*calls.lock().unwrap(), vec![json!({"page": 5})]);
  }

  #[tokio::test]
  async fn test_clean_after_clears_entry_on_drop() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let cache = ResourceCache::in_memory();

    let key = {
      let users = cache.resource(
        "list",
        paged_users(calls.clone()),
        json!({"page": 0}),
        ResourceOptions {
          clean_after: true,
          no_fetch: true,
        },
      );
      users.set_data(vec!["a".to_string()]);
      assert!(cache.get(users.key()).is_some());
      users.key().to_string()
    };

    assert_eq!(cache.get(&key), None);
  }

  #[tokio::test]
  async fn test_reload_persists_registered_key() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = ResourceCache::builder()
      .storage(storage.clone())
      .persist("list", "fetch_users")
      .build();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let users = cache.resource(
      "list",
      paged_users(calls),
      json!({"page": 0}),
      ResourceOptions {
        no_fetch: true,
        ..Default::default()
      },
    );

    let write = users.reload().await.expect("durable write scheduled");
    write.await.unwrap().unwrap();

    assert_eq!(
      storage.load(&resource_key("list", "fetch_users")).unwrap(),
      Some(json!(["a", "b"]))
    );
  }

  #[tokio::test]
  async fn test_subscriber_observes_reload() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let cache = ResourceCache::in_memory();

    let users = cache.resource(
      "list",
      paged_users(calls),
      json!({"page": 0}),
      ResourceOptions {
        no_fetch: true,
        ..Default::default()
      },
    );

    let mut rx = users.subscribe();
    let observed = async {
      rx.changed().await.unwrap();
      rx.borrow().clone()
    };

    let (_, observed) = tokio::join!(users.reload(), observed);
    assert_eq!(observed, Some(json!(["a", "b"])));
  }
}
