//! Request Cache
//!
//! Read-through cache over the shared store. Reads and writes fail open: a
//! store that cannot be reached turns into a miss or a skipped write, never
//! into an error for the caller. Keys and invalidation patterns are confined
//! to the `cache:` namespace.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::key::in_cache_namespace;
use crate::error::StoreError;
use crate::store::{StateStore, StoreStats};

/// A value plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub data: T,
    pub from_cache: bool,
}

impl<T> Cached<T> {
    pub fn hit(data: T) -> Self {
        Self {
            data,
            from_cache: true,
        }
    }

    pub fn miss(data: T) -> Self {
        Self {
            data,
            from_cache: false,
        }
    }
}

/// Cache of successful read-only results.
#[derive(Clone)]
pub struct RequestCache {
    store: Arc<dyn StateStore>,
}

impl RequestCache {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Returns the raw cached value, or `None` on a miss or store failure.
    pub async fn get(&self, key: &str) -> Option<String> {
        let key = in_cache_namespace(key);
        match self.store.get(&key).await {
            Ok(Some(value)) => {
                debug!(key = %key, "Cache hit");
                Some(value)
            }
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, bypassing cache");
                None
            }
        }
    }

    /// Stores `value` for `ttl`. Failures are logged and swallowed.
    pub async fn set(&self, key: &str, value: String, ttl: Duration) {
        let key = in_cache_namespace(key);
        if let Err(e) = self.store.set(&key, value, Some(ttl)).await {
            warn!(key = %key, error = %e, "Cache write failed, skipping");
        }
    }

    /// Typed read; an undecodable entry counts as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable cache entry ignored");
                None
            }
        }
    }

    /// Typed write.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(encoded) => self.set(key, encoded, ttl).await,
            Err(e) => warn!(key = %key, error = %e, "Cannot encode cache entry, skipping"),
        }
    }

    /// Returns the cached value for `key`, or runs `fetch` and caches its
    /// success for `ttl`. Errors from `fetch` are returned and never cached.
    pub async fn get_or_fetch<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(data) = self.get_json(key).await {
            return Ok(Cached::hit(data));
        }

        let data = fetch().await?;
        self.set_json(key, &data, ttl).await;
        Ok(Cached::miss(data))
    }

    /// Removes every cache entry matching the glob `pattern`; returns how many.
    ///
    /// The pattern only ever reaches cache keys: `*` clears the whole cache
    /// and leaves counters and other records alone. Unlike reads and writes
    /// this reports store failures, since the caller asked for the removal.
    pub async fn invalidate(&self, pattern: &str) -> Result<u64, StoreError> {
        let count = self
            .store
            .delete_matching(&in_cache_namespace(pattern))
            .await?;
        debug!(pattern = %pattern, count, "Cache invalidated");
        Ok(count)
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.store.stats().await
    }
}
