use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use folio_core::Clock;

use crate::retry::to_chrono;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache lock poisoned")]
    Poisoned,

    #[error("cache serialization error: {0}")]
    Serialization(String),

    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Expiry settings for one entry.
///
/// With both set, the entry expires at whichever deadline comes first; sliding
/// renewal never extends past the absolute deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheEntryOptions {
    /// Lifetime measured from the write.
    pub absolute_expiration: Option<Duration>,
    /// Idle lifetime, renewed by every read.
    pub sliding_expiration: Option<Duration>,
}

impl CacheEntryOptions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn absolute(ttl: Duration) -> Self {
        Self {
            absolute_expiration: Some(ttl),
            sliding_expiration: None,
        }
    }

    pub fn sliding(idle: Duration) -> Self {
        Self {
            absolute_expiration: None,
            sliding_expiration: Some(idle),
        }
    }

    pub fn with_absolute(mut self, ttl: Duration) -> Self {
        self.absolute_expiration = Some(ttl);
        self
    }

    pub fn with_sliding(mut self, idle: Duration) -> Self {
        self.sliding_expiration = Some(idle);
        self
    }
}

/// Key/value cache port. Values are opaque bytes.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    fn set(&self, key: &str, value: Vec<u8>, options: CacheEntryOptions) -> Result<(), CacheError>;

    /// Store only if no live entry exists. Returns whether the value was stored.
    fn set_if_absent(&self, key: &str, value: Vec<u8>, options: CacheEntryOptions) -> Result<bool, CacheError>;

    fn remove(&self, key: &str) -> Result<(), CacheError>;
}

impl<S> CacheStore for Arc<S>
where
    S: CacheStore + ?Sized,
{
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>, options: CacheEntryOptions) -> Result<(), CacheError> {
        (**self).set(key, value, options)
    }

    fn set_if_absent(&self, key: &str, value: Vec<u8>, options: CacheEntryOptions) -> Result<bool, CacheError> {
        (**self).set_if_absent(key, value, options)
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        (**self).remove(key)
    }
}

/// JSON helpers over any [`CacheStore`].
pub trait CacheStoreExt: CacheStore {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: CacheEntryOptions) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set(key, bytes, options)
    }
}

impl<S: CacheStore + ?Sized> CacheStoreExt for S {}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    absolute_deadline: Option<DateTime<Utc>>,
    sliding: Option<chrono::Duration>,
    last_access: DateTime<Utc>,
}

impl Entry {
    fn new(value: Vec<u8>, options: CacheEntryOptions, now: DateTime<Utc>) -> Self {
        Self {
            value,
            absolute_deadline: options.absolute_expiration.map(|ttl| now + to_chrono(ttl)),
            sliding: options.sliding_expiration.map(to_chrono),
            last_access: now,
        }
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        let sliding_deadline = self.sliding.map(|idle| self.last_access + idle);
        match (self.absolute_deadline, sliding_deadline) {
            (Some(a), Some(s)) => Some(a.min(s)),
            (a, s) => a.or(s),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }
}

/// Process-local cache with absolute and sliding expiry.
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCacheStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .read()
            .map(|entries| entries.values().filter(|e| !e.is_expired(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before - entries.len())
    }
}

impl core::fmt::Debug for InMemoryCacheStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryCacheStore").field("len", &self.len()).finish()
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;

        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get_mut(key).map(|entry| {
            entry.last_access = now;
            entry.value.clone()
        }))
    }

    fn set(&self, key: &str, value: Vec<u8>, options: CacheEntryOptions) -> Result<(), CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        entries.insert(key.to_string(), Entry::new(value, options, now));
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: Vec<u8>, options: CacheEntryOptions) -> Result<bool, CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        if entries.get(key).is_some_and(|entry| !entry.is_expired(now)) {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(value, options, now));
        Ok(true)
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}
