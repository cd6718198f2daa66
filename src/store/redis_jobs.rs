//! Redis Job Store Module
//!
//! Durable `JobStore` on Redis. A job is on disk once `push` returns, and
//! every process working a queue sees the same records.
//!
//! Layout under `<prefix>:`:
//! - `job:<id>` - the job record as JSON
//! - `queue:<name>:jobs` - set of every job id in the queue
//! - `queue:<name>:waiting` - sorted set of waiting ids scored by run-at time
//! - `queue:<name>:active` - sorted set of leased ids scored by lease end
//! - `queue:<name>:leases` - hash of leased id -> lease id
//! - `dedupe:<key>` - claim taken by `push_unique`, expiring after the
//!   retention window
//!
//! Moving ids between the sets and checking lease ownership happen in Lua
//! scripts, so each is a single atomic step on the server.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, warn};
use uuid::Uuid;

use super::jobs::require_waiting;
use super::memory::ttl_ms;
use super::{JobStore, QueueCounts, StoreResult};
use crate::error::StoreError;
use crate::jobs::{Job, JobId, JobState};

/// Claims the dedupe key, then queues the job. Nothing is written when the
/// claim already exists.
const PUSH_UNIQUE_SCRIPT: &str = r"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
  return 0
end
redis.call('SET', KEYS[2], ARGV[3])
redis.call('SADD', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
return 1
";

/// Returns expired leases to waiting, then leases the first due id.
const LEASE_SCRIPT: &str = r"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('HDEL', KEYS[3], id)
  redis.call('ZADD', KEYS[1], ARGV[1], id)
end
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #due == 0 then
  return false
end
local id = due[1]
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[2], ARGV[2], id)
redis.call('HSET', KEYS[3], id, ARGV[3])
return id
";

/// Writes the record back only while the caller's lease is still held.
const SETTLE_SCRIPT: &str = r"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('SET', KEYS[4], ARGV[3])
if ARGV[4] == '1' then
  redis.call('ZADD', KEYS[3], ARGV[5], ARGV[1])
end
return 1
";

const MGET_BATCH: usize = 100;

/// Key names of one queue.
struct QueueKeys {
    jobs: String,
    waiting: String,
    active: String,
    leases: String,
}

// == Redis Job Store ==
/// Job records and queues on Redis.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    prefix: String,
    claim_ttl: Duration,
    push_unique_script: Script,
    lease_script: Script,
    settle_script: Script,
}

impl RedisJobStore {
    /// Creates a store whose dedupe claims live for `claim_ttl`.
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>, claim_ttl: Duration) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            claim_ttl,
            push_unique_script: Script::new(PUSH_UNIQUE_SCRIPT),
            lease_script: Script::new(LEASE_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
        }
    }

    fn job_key(&self, id: impl std::fmt::Display) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn queue_keys(&self, queue: &str) -> QueueKeys {
        let base = format!("{}:queue:{}", self.prefix, queue);
        QueueKeys {
            jobs: format!("{}:jobs", base),
            waiting: format!("{}:waiting", base),
            active: format!("{}:active", base),
            leases: format!("{}:leases", base),
        }
    }

    async fn read(&self, key: &str) -> StoreResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    async fn write(&self, job: &Job) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.job_key(job.id))
            .arg(serde_json::to_string(job)?)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Every record of `queue` with its id; `None` for a dangling id.
    async fn load_queue(&self, queue: &str) -> StoreResult<Vec<(String, Option<Job>)>> {
        let mut conn = self.conn.clone();
        let keys = self.queue_keys(queue);
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&keys.jobs)
            .query_async(&mut conn)
            .await?;

        let mut loaded = Vec::with_capacity(ids.len());
        for batch in ids.chunks(MGET_BATCH) {
            let record_keys: Vec<String> = batch.iter().map(|id| self.job_key(id)).collect();
            let raws: Vec<Option<String>> = redis::cmd("MGET")
                .arg(&record_keys)
                .query_async(&mut conn)
                .await?;
            for (id, raw) in batch.iter().zip(raws) {
                let job = raw.map(|raw| serde_json::from_str::<Job>(&raw)).transpose()?;
                loaded.push((id.clone(), job));
            }
        }
        Ok(loaded)
    }

    /// Drops `ids` from every structure of `queue` and deletes their records.
    async fn forget(&self, queue: &str, ids: &[String]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let keys = self.queue_keys(queue);
        let record_keys: Vec<String> = ids.iter().map(|id| self.job_key(id)).collect();
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(&record_keys)
            .ignore()
            .cmd("SREM")
            .arg(&keys.jobs)
            .arg(ids)
            .ignore()
            .cmd("ZREM")
            .arg(&keys.waiting)
            .arg(ids)
            .ignore()
            .cmd("ZREM")
            .arg(&keys.active)
            .arg(ids)
            .ignore()
            .cmd("HDEL")
            .arg(&keys.leases)
            .arg(ids)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn push(&self, job: Job) -> StoreResult<()> {
        require_waiting(&job)?;
        let mut conn = self.conn.clone();
        let keys = self.queue_keys(&job.queue_name);
        let id = job.id.to_string();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.job_key(&id))
            .arg(serde_json::to_string(&job)?)
            .ignore()
            .cmd("SADD")
            .arg(&keys.jobs)
            .arg(&id)
            .ignore()
            .cmd("ZADD")
            .arg(&keys.waiting)
            .arg(job.scheduled_at)
            .arg(&id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn push_unique(&self, dedupe_key: &str, job: Job) -> StoreResult<bool> {
        require_waiting(&job)?;
        let mut conn = self.conn.clone();
        let keys = self.queue_keys(&job.queue_name);
        let id = job.id.to_string();
        let pushed: i64 = self
            .push_unique_script
            .key(format!("{}:dedupe:{}", self.prefix, dedupe_key))
            .key(self.job_key(&id))
            .key(&keys.jobs)
            .key(&keys.waiting)
            .arg(&id)
            .arg(ttl_ms(self.claim_ttl).max(1))
            .arg(serde_json::to_string(&job)?)
            .arg(job.scheduled_at)
            .invoke_async(&mut conn)
            .await?;
        Ok(pushed == 1)
    }

    async fn lease(&self, queue: &str, now_ms: u64, lease_ms: u64) -> StoreResult<Option<Job>> {
        let keys = self.queue_keys(queue);
        loop {
            let mut conn = self.conn.clone();
            let lease_id = Uuid::new_v4();
            let leased: Option<String> = self
                .lease_script
                .key(&keys.waiting)
                .key(&keys.active)
                .key(&keys.leases)
                .arg(now_ms)
                .arg(now_ms.saturating_add(lease_ms))
                .arg(lease_id.to_string())
                .invoke_async(&mut conn)
                .await?;
            let Some(id) = leased else {
                return Ok(None);
            };

            let Some(mut job) = self.read(&self.job_key(&id)).await? else {
                warn!(job_id = %id, queue = %queue, "Queued id has no record, dropping it");
                self.forget(queue, std::slice::from_ref(&id)).await?;
                continue;
            };

            if job.state == JobState::Active {
                warn!(job_id = %id, queue = %queue, "Lease expired, job returned to waiting");
                job.release_expired_lease()
                    .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;
            }
            job.start_with_lease(lease_id, now_ms, lease_ms)
                .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;
            self.write(&job).await?;
            debug!(job_id = %id, queue = %queue, "Job leased");
            return Ok(Some(job));
        }
    }

    async fn settle(&self, job: &Job, lease_id: Uuid) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let keys = self.queue_keys(&job.queue_name);
        let requeue = if job.state == JobState::Waiting { "1" } else { "0" };
        let settled: i64 = self
            .settle_script
            .key(&keys.leases)
            .key(&keys.active)
            .key(&keys.waiting)
            .key(self.job_key(job.id))
            .arg(job.id.to_string())
            .arg(lease_id.to_string())
            .arg(serde_json::to_string(job)?)
            .arg(requeue)
            .arg(job.scheduled_at)
            .invoke_async(&mut conn)
            .await?;
        Ok(settled == 1)
    }

    async fn get(&self, id: JobId) -> StoreResult<Option<Job>> {
        self.read(&self.job_key(id)).await
    }

    async fn remove(&self, id: JobId) -> StoreResult<bool> {
        let Some(job) = self.get(id).await? else {
            return Ok(false);
        };
        self.forget(&job.queue_name, &[id.to_string()]).await?;
        Ok(true)
    }

    async fn prune(&self, queue: &str, older_than_ms: u64) -> StoreResult<u64> {
        let doomed: Vec<String> = self
            .load_queue(queue)
            .await?
            .into_iter()
            .filter(|(_, job)| match job {
                Some(job) => {
                    job.is_terminal() && job.finished_at.is_some_and(|at| at <= older_than_ms)
                }
                None => true,
            })
            .map(|(id, _)| id)
            .collect();

        self.forget(queue, &doomed).await?;
        Ok(doomed.len() as u64)
    }

    async fn counts(&self, queue: &str) -> StoreResult<QueueCounts> {
        let mut counts = QueueCounts::default();
        for (_, job) in self.load_queue(queue).await? {
            match job.map(|job| job.state) {
                Some(JobState::Waiting) => counts.waiting += 1,
                Some(JobState::Active) => counts.active += 1,
                Some(JobState::Completed) => counts.completed += 1,
                Some(JobState::Failed) => counts.failed += 1,
                Some(JobState::Created) | None => {}
            }
        }
        Ok(counts)
    }
}
