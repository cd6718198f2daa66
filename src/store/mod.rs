//! Shared State Store Module
//!
//! The key-value store and the durable job store every component talks to.
//! Processes never coordinate through in-process locks; correctness rests on
//! the atomic primitives declared here (increment-with-expiry, release,
//! claimed push, leased dequeue).
//!
//! Two backends: Redis for deployments, where records survive restarts and
//! are shared by every process, and an in-process one for tests and single
//! process development.

mod entry;
mod jobs;
mod lru;
mod memory;
mod redis_jobs;
mod redis_store;
mod stats;


use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::jobs::{Job, JobId};

// Re-export public types
pub use entry::CacheEntry;
pub use jobs::MemoryJobStore;
pub use lru::LruTracker;
pub use memory::{MemoryStore, StoreState};
pub use redis_jobs::RedisJobStore;
pub use redis_store::{connect, RedisStore};
pub use stats::StoreStats;

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;

/// Maximum allowed value size in bytes
pub const MAX_VALUE_SIZE: usize = 1024 * 1024; // 1 MB

/// Convenience Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// == Counter ==
/// Value of an atomic counter after an increment or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Current count
    pub count: u64,
    /// When the counter expires (Unix ms); `u64::MAX` when it never does
    pub expires_at_ms: u64,
}

// == State Store Trait ==
/// Key-value store with expiry, glob deletion and atomic counters.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns the value for `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()>;

    /// Removes every key matching the glob `pattern`; returns how many.
    async fn delete_matching(&self, pattern: &str) -> StoreResult<u64>;

    /// Atomically increments the counter at `key`.
    ///
    /// The expiry is set only when the increment creates the counter, so a
    /// window never slides forward on later increments.
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<Counter>;

    /// Atomically takes one back from a live counter, never below zero.
    ///
    /// The window is left as it is; an absent counter is not created.
    async fn release(&self, key: &str) -> StoreResult<Option<Counter>>;

    /// Returns store statistics.
    async fn stats(&self) -> StoreResult<StoreStats>;
}

// == Queue Counts ==
/// Number of jobs per state in one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

// == Job Store Trait ==
/// Durable storage for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a `Waiting` job at the back of its queue.
    async fn push(&self, job: Job) -> StoreResult<()>;

    /// Persists `job` only if no live claim exists on `dedupe_key`.
    ///
    /// A claim lives at least as long as the job retention window, after
    /// which `prune` may drop it.
    async fn push_unique(&self, dedupe_key: &str, job: Job) -> StoreResult<bool>;

    /// Leases the oldest eligible `Waiting` job of `queue`.
    ///
    /// Jobs whose lease expired at or before `now_ms` are first returned to
    /// `Waiting`. The leased job is `Active` until `now_ms + lease_ms`.
    async fn lease(&self, queue: &str, now_ms: u64, lease_ms: u64) -> StoreResult<Option<Job>>;

    /// Writes back a job leased under `lease_id`. Returns `false`, leaving
    /// the stored record untouched, when that lease is no longer held.
    async fn settle(&self, job: &Job, lease_id: Uuid) -> StoreResult<bool>;

    /// Returns a job record.
    async fn get(&self, id: JobId) -> StoreResult<Option<Job>>;

    /// Deletes a job record.
    async fn remove(&self, id: JobId) -> StoreResult<bool>;

    /// Deletes terminal jobs of `queue` that finished at or before `older_than_ms`.
    async fn prune(&self, queue: &str, older_than_ms: u64) -> StoreResult<u64>;

    /// Counts jobs by state.
    async fn counts(&self, queue: &str) -> StoreResult<QueueCounts>;
}
