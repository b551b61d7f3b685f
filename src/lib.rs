//! Keyed cache for remote resources with reactive handles and local
//! persistence.
//!
//! This crate provides:
//! - A shared [`ResourceCache`]: one flat mapping from cache key to JSON
//!   value, with per-key change notification
//! - [`Resource`] handles binding one cache entry to one [`Service`], with
//!   loading/error state, reload, direct writes and page-append fetching
//! - Optional mirroring of a fixed key set to durable storage
//!   ([`SqliteStorage`] or any [`PersistentStorage`] backend), reloaded at
//!   startup via [`ResourceCache::load_all_persisted`]
//!
//! The cache is created once per application and passed explicitly to
//! consumers; handles are derived views over it, never independent copies.
//! Writes to one key are observed by every handle and subscriber bound to
//! that key, last write wins, and nothing cancels an in-flight service call.

mod cache;
mod resource;
mod storage;
mod traits;

pub use cache::{resource_key, ResourceCache, ResourceCacheBuilder};
pub use resource::{Resource, ResourceOptions};
pub use storage::{MemoryStorage, NoopStorage, PersistentStorage, SqliteStorage};
pub use traits::{service_fn, BoxFuture, Merge, Paged, Service, ServiceFn};
