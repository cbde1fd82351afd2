//! Read-through caching for collection listings and single entities.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::store::{CacheEntryOptions, CacheError, CacheStore, CacheStoreExt};
use super::version_token::VersionTokenRegistry;

/// Parameters of one collection read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub page: u32,
    pub page_size: u32,
    /// Case-insensitive substring filter.
    pub filter: Option<String>,
    pub sort: Option<String>,
}

impl ListQuery {
    pub fn page(page: u32, page_size: u32) -> Self {
        Self {
            page,
            page_size,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    /// Stable hex fingerprint of the query parameters.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.page.to_be_bytes());
        hasher.update(self.page_size.to_be_bytes());
        for part in [&self.filter, &self.sort] {
            match part {
                Some(value) => {
                    hasher.update([1u8]);
                    hasher.update((value.len() as u64).to_be_bytes());
                    hasher.update(value.as_bytes());
                }
                None => hasher.update([0u8]),
            }
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

/// Cache key of one collection page under a given version token.
pub fn list_cache_key(collection: &str, token: &str, query: &ListQuery) -> String {
    format!("{collection}:list:{token}:{}", query.fingerprint())
}

/// A value plus whether it came from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub hit: bool,
}

/// Read-through cache for collection pages keyed by version token.
///
/// The cache is never authoritative: any cache failure is logged and the read
/// falls through to the loader.
#[derive(Clone)]
pub struct ListCache {
    cache: Arc<dyn CacheStore>,
    tokens: VersionTokenRegistry,
    options: CacheEntryOptions,
}

impl ListCache {
    pub fn new(cache: Arc<dyn CacheStore>, tokens: VersionTokenRegistry, options: CacheEntryOptions) -> Self {
        Self { cache, tokens, options }
    }

    pub fn get_or_load<T, E, F>(&self, collection: &str, query: &ListQuery, load: F) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        let key = match self.tokens.current(collection) {
            Ok(token) => Some(list_cache_key(collection, &token, query)),
            Err(err) => {
                warn!(collection, error = %err, "version token unavailable, bypassing cache");
                None
            }
        };

        if let Some(key) = &key {
            match self.cache.get_json::<T>(key) {
                Ok(Some(value)) => {
                    debug!(collection, "list cache hit");
                    return Ok(Cached { value, hit: true });
                }
                Ok(None) => debug!(collection, "list cache miss"),
                Err(err) => warn!(collection, error = %err, "list cache read failed"),
            }
        }

        let value = load()?;
        if let Some(key) = &key {
            store_best_effort(self.cache.as_ref(), key, &value, self.options);
        }
        Ok(Cached { value, hit: false })
    }
}

/// Read-through cache for single entities keyed by point key.
///
/// Only found entities are cached; writes remove their key on commit.
#[derive(Clone)]
pub struct EntityCache {
    cache: Arc<dyn CacheStore>,
    options: CacheEntryOptions,
}

impl EntityCache {
    pub fn new(cache: Arc<dyn CacheStore>, options: CacheEntryOptions) -> Self {
        Self { cache, options }
    }

    pub fn get_or_load<T, E, F>(&self, key: &str, load: F) -> Result<Cached<Option<T>>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<Option<T>, E>,
    {
        match self.cache.get_json::<T>(key) {
            Ok(Some(value)) => {
                return Ok(Cached {
                    value: Some(value),
                    hit: true,
                });
            }
            Ok(None) => {}
            Err(err) => warn!(key, error = %err, "entity cache read failed"),
        }

        let value = load()?;
        if let Some(found) = &value {
            store_best_effort(self.cache.as_ref(), key, found, self.options);
        }
        Ok(Cached { value, hit: false })
    }

    pub fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.cache.remove(key)
    }
}

fn store_best_effort<T: Serialize>(cache: &dyn CacheStore, key: &str, value: &T, options: CacheEntryOptions) {
    if let Err(err) = cache.set_json(key, value, options) {
        warn!(key, error = %err, "cache write failed");
    }
}
