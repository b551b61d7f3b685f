//! Core traits for the resource cache: the service contract, pagination
//! and page merging.

use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use tracing::warn;

/// A boxed future that resolves to a Result<T>
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// A remote data source.
///
/// A service is an async call plus a stable name; the name is combined with a
/// logical key to derive the cache key, so it must not change between calls
/// that should share a cache entry.
pub trait Service: Send + Sync + 'static {
  /// Parameters the service accepts.
  type Params: Clone + Send + Sync + 'static;

  /// Data the service produces. Crosses the cache boundary as JSON.
  type Output: Serialize + DeserializeOwned + Send + 'static;

  /// Stable identifier for this service (e.g., "fetch_users").
  fn name(&self) -> &str;

  /// Run the service call.
  fn call(&self, params: Self::Params) -> BoxFuture<Self::Output>;
}

/// Adapter that turns an async closure into a [`Service`].
///
/// # Example
///
/// ```ignore
/// let fetch_users = service_fn("fetch_users", |params: Value| async move {
///     client.get_users(params).await
/// });
/// ```
pub struct ServiceFn<F, P> {
  name: String,
  f: F,
  _params: PhantomData<fn(P)>,
}

/// Create a [`Service`] from a name and an async closure.
pub fn service_fn<F, Fut, P, T>(name: impl Into<String>, f: F) -> ServiceFn<F, P>
where
  F: Fn(P) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T>> + Send + 'static,
  P: Clone + Send + Sync + 'static,
  T: Serialize + DeserializeOwned + Send + 'static,
{
  ServiceFn {
    name: name.into(),
    f,
    _params: PhantomData,
  }
}

impl<F, Fut, P, T> Service for ServiceFn<F, P>
where
  F: Fn(P) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T>> + Send + 'static,
  P: Clone + Send + Sync + 'static,
  T: Serialize + DeserializeOwned + Send + 'static,
{
  type Params = P;
  type Output = T;

  fn name(&self) -> &str {
    &self.name
  }

  fn call(&self, params: P) -> BoxFuture<T> {
    Box::pin((self.f)(params))
  }
}

/// Parameter types that carry a page number.
///
/// Needed by [`Resource::load_more`](crate::Resource::load_more) to derive
/// the next page's parameters.
pub trait Paged: Sized {
  /// Current page number, if the parameters carry one.
  fn page(&self) -> Option<u64>;

  /// The same parameters pointed at the given page.
  fn with_page(self, page: u64) -> Self;
}

/// JSON parameters page via a top-level `"page"` field.
impl Paged for Value {
  fn page(&self) -> Option<u64> {
    self.get("page").and_then(Value::as_u64)
  }

  fn with_page(mut self, page: u64) -> Self {
    if let Some(map) = self.as_object_mut() {
      map.insert("page".to_string(), Value::from(page));
    }
    self
  }
}

/// Derive parameters for the next page.
///
/// Parameters without a page field are passed through unchanged, with a
/// warning - the fetch still happens.
pub(crate) fn next_page_params<P: Paged>(params: P) -> P {
  match params.page() {
    Some(page) => params.with_page(page + 1),
    None => {
      warn!("cannot find page in params, fetching with unchanged params");
      params
    }
  }
}

/// How to combine an existing cached value with a freshly fetched page.
pub trait Merge {
  fn merge(previous: Self, next: Self) -> Self;
}

/// Ordered sequences merge by concatenation.
impl<T> Merge for Vec<T> {
  fn merge(mut previous: Self, next: Self) -> Self {
    previous.extend(next);
    previous
  }
}

/// JSON arrays merge by concatenation; any other shape is replaced by the
/// fetched value.
impl Merge for Value {
  fn merge(previous: Self, next: Self) -> Self {
    match (previous, next) {
      (Value::Array(mut previous), Value::Array(next)) => {
        previous.extend(next);
        Value::Array(previous)
      }
      (_, next) => next,
    }
  }
}
