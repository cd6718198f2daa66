//! Memory Store Module
//!
//! In-process `StateStore`: a HashMap of entries with TTL expiry and atomic
//! counters, guarded by a single lock so every operation is atomic with
//! respect to every other. Only plain values written with a TTL take part in
//! LRU eviction; counters and values without a TTL are never evicted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};
use tokio::sync::RwLock;

use super::{
    CacheEntry, Counter, LruTracker, StateStore, StoreResult, StoreStats, MAX_KEY_LENGTH,
    MAX_VALUE_SIZE,
};
use crate::clock::Clock;
use crate::error::StoreError;

// == Store State ==
/// Entry table with TTL support and volatile LRU eviction.
///
/// Every operation takes `now` explicitly; the owner decides what time it is.
#[derive(Debug)]
pub struct StoreState {
    /// Key-value storage
    entries: HashMap<String, CacheEntry>,
    /// Access order of the evictable entries only
    lru: LruTracker,
    /// Performance statistics
    stats: StoreStats,
    /// Maximum number of entries allowed
    max_entries: usize,
}

impl StoreState {
    // == Constructor ==
    /// Creates an empty table holding at most `max_entries` entries.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru: LruTracker::new(),
            stats: StoreStats::new(),
            max_entries: max_entries.max(1),
        }
    }

    // == Set ==
    /// Stores a key-value pair with optional TTL.
    ///
    /// If the key already exists, the value is overwritten and TTL is reset.
    /// At capacity the least recently used evictable entry makes room; with
    /// nothing evictable the write fails with `StoreError::Full`.
    pub fn set(&mut self, key: &str, value: String, ttl_ms: Option<u64>, now: u64) -> StoreResult<()> {
        validate(key, &value)?;
        self.make_room(key, now)?;

        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl_ms, now));
        if ttl_ms.is_some() {
            self.lru.touch(key);
        } else {
            self.lru.remove(key);
        }
        Ok(())
    }

    // == Get ==
    /// Retrieves a live value by key.
    ///
    /// Expired entries are removed on sight and counted as misses.
    pub fn get(&mut self, key: &str, now: u64) -> Option<String> {
        match self.live(key, now) {
            Some(entry) => {
                let value = entry.value.clone();
                self.stats.record_hit();
                if self.lru.contains(key) {
                    self.lru.touch(key);
                }
                Some(value)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    // == Delete Matching ==
    /// Removes every live key matched by `matcher`.
    pub fn delete_matching(&mut self, matcher: &GlobMatcher, now: u64) -> u64 {
        let doomed: Vec<(String, bool)> = self
            .entries
            .iter()
            .filter(|(key, _)| matcher.is_match(key.as_str()))
            .map(|(key, entry)| (key.clone(), !entry.is_expired_at(now)))
            .collect();

        let mut removed = 0;
        for (key, live) in doomed {
            self.remove(&key);
            if live {
                removed += 1;
            }
        }
        removed
    }

    // == Increment ==
    /// Adds one to the counter at `key`, creating it with `ttl_ms` if absent.
    ///
    /// Counters are never evicted; they leave the table only by expiring.
    pub fn increment(&mut self, key: &str, ttl_ms: u64, now: u64) -> StoreResult<Counter> {
        let (count, expires_at) = match self.live(key, now) {
            Some(entry) => (parse_count(key, entry)? + 1, entry.expires_at),
            None => (1, Some(now.saturating_add(ttl_ms))),
        };
        self.make_room(key, now)?;
        self.write_counter(key, count, expires_at, now)
    }

    // == Release ==
    /// Takes one back from a live counter, never below zero.
    ///
    /// The expiry is kept; an absent or expired counter stays absent.
    pub fn release(&mut self, key: &str, now: u64) -> StoreResult<Option<Counter>> {
        let (count, expires_at) = match self.live(key, now) {
            Some(entry) => (parse_count(key, entry)?.saturating_sub(1), entry.expires_at),
            None => return Ok(None),
        };
        self.write_counter(key, count, expires_at, now).map(Some)
    }

    // == Cleanup Expired ==
    /// Removes all expired entries; returns the number removed.
    pub fn cleanup_expired(&mut self, now: u64) -> usize {
        let expired_keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        let count = expired_keys.len();
        for key in expired_keys {
            self.remove(&key);
        }
        self.stats.record_expired(count);
        count
    }

    // == Stats ==
    /// Returns current statistics.
    pub fn stats(&self) -> StoreStats {
        let mut stats = self.stats.clone();
        stats.total_entries = self.entries.len();
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the live entry for `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str, now: u64) -> Option<&CacheEntry> {
        if self
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_expired_at(now))
        {
            self.remove(key);
            self.stats.record_expired(1);
        }
        self.entries.get(key)
    }

    fn write_counter(
        &mut self,
        key: &str,
        count: u64,
        expires_at: Option<u64>,
        now: u64,
    ) -> StoreResult<Counter> {
        let entry = CacheEntry {
            value: count.to_string(),
            created_at: now,
            expires_at,
        };
        self.entries.insert(key.to_string(), entry);
        self.lru.remove(key);

        Ok(Counter {
            count,
            expires_at_ms: expires_at.unwrap_or(u64::MAX),
        })
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.lru.remove(key);
    }

    /// Frees one slot for a new `key` when the table is full.
    fn make_room(&mut self, key: &str, now: u64) -> StoreResult<()> {
        if self.entries.contains_key(key) || self.entries.len() < self.max_entries {
            return Ok(());
        }
        // expired entries go before live ones
        if self.cleanup_expired(now) > 0 {
            return Ok(());
        }
        match self.lru.evict_oldest() {
            Some(evicted) => {
                self.entries.remove(&evicted);
                self.stats.record_eviction();
                Ok(())
            }
            None => Err(StoreError::Full(
                "Store is full and holds no evictable entries".to_string(),
            )),
        }
    }
}

fn parse_count(key: &str, entry: &CacheEntry) -> StoreResult<u64> {
    entry
        .value
        .parse()
        .map_err(|_| StoreError::InvalidRequest(format!("Value at '{}' is not a counter", key)))
}

/// Rejects keys and values the store refuses to hold.
pub(crate) fn validate(key: &str, value: &str) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidRequest("Key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(StoreError::InvalidRequest(format!(
            "Key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(StoreError::InvalidRequest(format!(
            "Value exceeds maximum size of {} bytes",
            MAX_VALUE_SIZE
        )));
    }
    Ok(())
}

/// Compiles a key glob where `*` also crosses `:` and `/`.
pub(crate) fn compile_glob(pattern: &str) -> StoreResult<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| StoreError::InvalidRequest(format!("Invalid pattern '{}': {}", pattern, e)))
}

pub(crate) fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

// == Memory Store ==
/// Shared, clock-driven handle over a [`StoreState`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Creates a store holding at most `max_entries` entries.
    pub fn new(max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::new(max_entries))),
            clock,
        }
    }

    /// Physically removes expired entries; returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        self.state.write().await.cleanup_expired(now)
    }

    /// Returns the number of stored entries, expired-but-unswept included.
    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now_ms();
        Ok(self.state.write().await.get(key, now))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        let now = self.clock.now_ms();
        self.state
            .write()
            .await
            .set(key, value, ttl.map(ttl_ms), now)
    }

    async fn delete_matching(&self, pattern: &str) -> StoreResult<u64> {
        let matcher = compile_glob(pattern)?;
        let now = self.clock.now_ms();
        Ok(self.state.write().await.delete_matching(&matcher, now))
    }

    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<Counter> {
        let now = self.clock.now_ms();
        self.state.write().await.increment(key, ttl_ms(ttl), now)
    }

    async fn release(&self, key: &str) -> StoreResult<Option<Counter>> {
        let now = self.clock.now_ms();
        self.state.write().await.release(key, now)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        Ok(self.state.read().await.stats())
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const MINUTE: u64 = 60_000;

    #[test]
    fn test_state_set_and_get() {
        let mut state = StoreState::new(100);

        state.set("key1", "value1".to_string(), None, 0).unwrap();

        assert_eq!(state.get("key1", 0), Some("value1".to_string()));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_state_get_nonexistent_is_miss() {
        let mut state = StoreState::new(100);

        assert_eq!(state.get("nonexistent", 0), None);
        assert_eq!(state.stats().misses, 1);
    }

    #[test]
    fn test_state_overwrite_keeps_one_entry() {
        let mut state = StoreState::new(100);

        state.set("key1", "value1".to_string(), Some(MINUTE), 0).unwrap();
        state.set("key1", "value2".to_string(), Some(MINUTE), 10).unwrap();

        assert_eq!(state.get("key1", 20), Some("value2".to_string()));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_state_ttl_expiration_without_sweep() {
        let mut state = StoreState::new(100);

        state.set("key1", "value1".to_string(), Some(1_000), 0).unwrap();

        assert!(state.get("key1", 999).is_some());
        assert!(state.get("key1", 1_000).is_none());
    }

    #[test]
    fn test_state_lru_eviction() {
        let mut state = StoreState::new(3);

        state.set("key1", "value1".to_string(), Some(MINUTE), 0).unwrap();
        state.set("key2", "value2".to_string(), Some(MINUTE), 0).unwrap();
        state.set("key3", "value3".to_string(), Some(MINUTE), 0).unwrap();
        // key1 becomes most recent, key2 is next out
        state.get("key1", 0);
        state.set("key4", "value4".to_string(), Some(MINUTE), 0).unwrap();

        assert_eq!(state.len(), 3);
        assert!(state.get("key1", 0).is_some());
        assert!(state.get("key2", 0).is_none());
        assert_eq!(state.stats().evictions, 1);
    }

    #[test]
    fn test_state_eviction_skips_counters_and_persistent_values() {
        let mut state = StoreState::new(3);

        state.increment("ratelimit:auth:10.0.0.1", 15 * MINUTE, 0).unwrap();
        state.set("analytics:latest", "{}".into(), None, 0).unwrap();
        for i in 0..50 {
            state
                .set(&format!("cache:GET:/api/analytics?page={}", i), "{}".into(), Some(MINUTE), 1)
                .unwrap();
        }

        assert_eq!(state.len(), 3);
        assert_eq!(state.stats().evictions, 49);
        assert!(state.get("analytics:latest", 2).is_some());
        let counter = state.increment("ratelimit:auth:10.0.0.1", 15 * MINUTE, 2).unwrap();
        assert_eq!(counter.count, 2);
    }

    #[test]
    fn test_state_full_of_unevictable_entries_rejects_writes() {
        let mut state = StoreState::new(2);
        state.increment("ratelimit:general:a", MINUTE, 0).unwrap();
        state.set("analytics:latest", "{}".into(), None, 0).unwrap();

        assert!(matches!(
            state.set("cache:quote:random", "{}".into(), Some(MINUTE), 0),
            Err(StoreError::Full(_))
        ));
        assert!(matches!(
            state.increment("ratelimit:general:b", MINUTE, 0),
            Err(StoreError::Full(_))
        ));
        // an expired counter frees its slot
        assert!(state.increment("ratelimit:general:b", MINUTE, MINUTE).is_ok());
    }

    #[test]
    fn test_state_delete_matching_glob() {
        let mut state = StoreState::new(100);
        state.set("weather:mumbai", "a".into(), None, 0).unwrap();
        state.set("weather:paris", "b".into(), None, 0).unwrap();
        state.set("news:us:tech", "c".into(), None, 0).unwrap();

        let matcher = compile_glob("weather:*").unwrap();
        assert_eq!(state.delete_matching(&matcher, 0), 2);

        assert!(state.get("news:us:tech", 0).is_some());
        assert!(state.get("weather:paris", 0).is_none());
    }

    #[test]
    fn test_state_star_matches_everything() {
        let mut state = StoreState::new(100);
        state.set("cache:GET:/api/analytics?a=1", "a".into(), None, 0).unwrap();
        state.set("news:us:tech", "c".into(), None, 0).unwrap();

        let matcher = compile_glob("*").unwrap();
        assert_eq!(state.delete_matching(&matcher, 0), 2);
        assert!(state.is_empty());
    }

    #[test]
    fn test_state_delete_matching_skips_expired_in_count() {
        let mut state = StoreState::new(100);
        state.set("weather:old", "a".into(), Some(10), 0).unwrap();
        state.set("weather:new", "b".into(), None, 0).unwrap();

        let matcher = compile_glob("weather:*").unwrap();
        assert_eq!(state.delete_matching(&matcher, 100), 1);
        assert!(state.is_empty());
    }

    #[test]
    fn test_state_increment_keeps_original_expiry() {
        let mut state = StoreState::new(100);

        let first = state.increment("hits", MINUTE, 0).unwrap();
        let second = state.increment("hits", MINUTE, 30_000).unwrap();

        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert_eq!(second.expires_at_ms, MINUTE);
    }

    #[test]
    fn test_state_increment_restarts_after_expiry() {
        let mut state = StoreState::new(100);

        state.increment("hits", MINUTE, 0).unwrap();
        let fresh = state.increment("hits", MINUTE, 61_000).unwrap();

        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.expires_at_ms, 61_000 + MINUTE);
    }

    #[test]
    fn test_state_increment_rejects_non_counter() {
        let mut state = StoreState::new(100);
        state.set("text", "hello".into(), None, 0).unwrap();

        assert!(matches!(
            state.increment("text", MINUTE, 0),
            Err(StoreError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_state_release_keeps_window() {
        let mut state = StoreState::new(100);

        assert_eq!(state.release("hits", 0).unwrap(), None);
        state.increment("hits", MINUTE, 0).unwrap();
        state.increment("hits", MINUTE, 10).unwrap();

        let released = state.release("hits", 20).unwrap().unwrap();
        assert_eq!(released.count, 1);
        assert_eq!(released.expires_at_ms, MINUTE);

        state.release("hits", 30).unwrap();
        assert_eq!(state.release("hits", 40).unwrap().map(|c| c.count), Some(0));
        assert_eq!(state.release("hits", MINUTE).unwrap(), None);
    }

    #[test]
    fn test_state_cleanup_expired() {
        let mut state = StoreState::new(100);

        state.set("key1", "value1".into(), Some(1_000), 0).unwrap();
        state.set("key2", "value2".into(), Some(10_000), 0).unwrap();

        assert_eq!(state.cleanup_expired(1_100), 1);
        assert_eq!(state.len(), 1);
        assert_eq!(state.stats().expired, 1);
    }

    #[test]
    fn test_state_key_validation() {
        let mut state = StoreState::new(100);
        let long_key = "x".repeat(MAX_KEY_LENGTH + 1);
        let large_value = "x".repeat(MAX_VALUE_SIZE + 1);

        assert!(matches!(
            state.set(&long_key, "v".into(), None, 0),
            Err(StoreError::InvalidRequest(_))
        ));
        assert!(matches!(
            state.set("key", large_value, None, 0),
            Err(StoreError::InvalidRequest(_))
        ));
        assert!(matches!(
            state.set("", "v".into(), None, 0),
            Err(StoreError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_invalid_glob_is_rejected() {
        assert!(matches!(
            compile_glob("weather:[unclosed"),
            Err(StoreError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_uses_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(100, clock.clone());

        store
            .set("k", "v".into(), Some(Duration::from_secs(600)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(599));
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_purge_expired() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(100, clock.clone());

        store
            .set("short", "v".into(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store.set("forever", "v".into(), None).await.unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_store_concurrent_increments_are_atomic() {
        let store = MemoryStore::new(100, Arc::new(ManualClock::new(0)));
        let mut handles = Vec::new();

        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .increment("ratelimit:general:alice", Duration::from_secs(60))
                    .await
                    .unwrap()
                    .count
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=50).collect::<Vec<u64>>());
    }
}
