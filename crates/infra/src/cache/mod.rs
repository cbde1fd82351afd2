//! Disposable caching: a key/value port, collection version tokens and
//! read-through helpers. Nothing here is authoritative.

mod read_through;
mod store;
mod version_token;

pub use read_through::{Cached, EntityCache, ListCache, ListQuery, list_cache_key};
pub use store::{CacheEntryOptions, CacheError, CacheStore, CacheStoreExt, InMemoryCacheStore};
pub use version_token::{VersionTokenRegistry, token_key};
