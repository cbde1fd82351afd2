//! Collection version tokens.
//!
//! A cached collection read is keyed by the collection's current token. A
//! write bumps the token instead of hunting down every cached page, so stale
//! pages simply stop being addressed and age out on their own TTL.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use super::store::{CacheEntryOptions, CacheError, CacheStore};

const TOKEN_KEY_PREFIX: &str = "version-token:";

pub fn token_key(collection: &str) -> String {
    format!("{TOKEN_KEY_PREFIX}{collection}")
}

fn fresh_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Clone)]
pub struct VersionTokenRegistry {
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl core::fmt::Debug for VersionTokenRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VersionTokenRegistry").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl VersionTokenRegistry {
    pub fn new(cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    fn options(&self) -> CacheEntryOptions {
        CacheEntryOptions::absolute(self.ttl)
    }

    /// Current token for `collection`, seeding one if none is live.
    pub fn current(&self, collection: &str) -> Result<String, CacheError> {
        let key = token_key(collection);
        if let Some(token) = self.read(&key)? {
            return Ok(token);
        }

        let token = fresh_token();
        if self.cache.set_if_absent(&key, token.clone().into_bytes(), self.options())? {
            debug!(collection, "version token seeded");
            return Ok(token);
        }
        // Another reader seeded first; use theirs.
        Ok(self.read(&key)?.unwrap_or(token))
    }

    /// Replace the token, orphaning every cached read keyed by the old one.
    pub fn bump(&self, collection: &str) -> Result<String, CacheError> {
        let token = fresh_token();
        self.cache
            .set(&token_key(collection), token.clone().into_bytes(), self.options())?;
        debug!(collection, "version token bumped");
        Ok(token)
    }

    fn read(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.cache.get(key)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }
}
