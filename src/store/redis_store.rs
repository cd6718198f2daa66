//! Redis Store Module
//!
//! `StateStore` over a Redis server shared by every process. Keys live under
//! `<prefix>:`. Counter arithmetic runs in Lua scripts so an increment and
//! the expiry it sets are one atomic step on the server.
//!
//! Redis expires keys itself, so `evictions` and `expired` stay at zero in
//! the reported statistics. Run the server with `maxmemory-policy noeviction`
//! or size it so rate limit counters are never evicted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::info;

use super::memory::{compile_glob, ttl_ms, validate};
use super::{Counter, StateStore, StoreResult, StoreStats};
use crate::clock::Clock;

/// INCR, then start the window if the counter has none yet.
const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

/// DECR a live counter unless it is already zero; the window is untouched.
const RELEASE_SCRIPT: &str = r"
local count = tonumber(redis.call('GET', KEYS[1]))
if not count then
  return false
end
if count > 0 then
  count = redis.call('DECR', KEYS[1])
end
return {count, redis.call('PTTL', KEYS[1])}
";

const SCAN_BATCH: usize = 100;

/// Opens a managed connection and checks the server answers.
pub async fn connect(url: &str) -> StoreResult<ConnectionManager> {
    let client = Client::open(url)?;
    let mut conn = ConnectionManager::new(client).await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    info!(url = %url, "Connected to Redis");
    Ok(conn)
}

// == Redis Store ==
/// Shared key-value store on Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    clock: Arc<dyn Clock>,
    increment_script: Script,
    release_script: Script,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            clock,
            increment_script: Script::new(INCREMENT_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    fn counter_at(&self, count: u64, pttl_ms: i64) -> Counter {
        Counter {
            count,
            expires_at_ms: expiry_from_pttl(self.clock.now_ms(), pttl_ms),
        }
    }
}

/// Absolute expiry from a `PTTL` answer; negative means no expiry.
fn expiry_from_pttl(now: u64, pttl_ms: i64) -> u64 {
    match u64::try_from(pttl_ms) {
        Ok(remaining) => now.saturating_add(remaining),
        Err(_) => u64::MAX,
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await?;
        let tally = if value.is_some() { &self.hits } else { &self.misses };
        tally.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        validate(key, &value)?;
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.full_key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_ms(ttl).max(1));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> StoreResult<u64> {
        compile_glob(pattern)?;
        let mut conn = self.conn.clone();
        let full_pattern = self.full_key(pattern);
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += deleted;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(removed)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<Counter> {
        let mut conn = self.conn.clone();
        let (count, pttl): (u64, i64) = self
            .increment_script
            .key(self.full_key(key))
            .arg(ttl_ms(ttl).max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(self.counter_at(count, pttl))
    }

    async fn release(&self, key: &str) -> StoreResult<Option<Counter>> {
        let mut conn = self.conn.clone();
        let released: Option<(u64, i64)> = self
            .release_script
            .key(self.full_key(key))
            .invoke_async(&mut conn)
            .await?;
        Ok(released.map(|(count, pttl)| self.counter_at(count, pttl)))
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let mut conn = self.conn.clone();
        let total: usize = redis::cmd("DBSIZE").query_async(&mut conn).await?;
        Ok(StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            total_entries: total,
            ..StoreStats::default()
        })
    }
}
