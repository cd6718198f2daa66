//! Memory Job Store Module
//!
//! In-process `JobStore`. Each queue keeps a FIFO of waiting job ids; a job
//! that goes back to `Waiting` (retry or lost lease) re-enters at the back.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{JobStore, QueueCounts, StoreResult};
use crate::error::StoreError;
use crate::jobs::{Job, JobId, JobState};

#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<JobId, Job>,
    /// Waiting job ids per queue, in eligibility order
    waiting: HashMap<String, VecDeque<JobId>>,
    /// Dedupe key -> claim taken by `push_unique`
    claimed: HashMap<String, Claim>,
}

#[derive(Debug)]
struct Claim {
    queue: String,
    claimed_at: u64,
}

impl JobTable {
    fn insert_waiting(&mut self, job: Job) -> StoreResult<()> {
        require_waiting(&job)?;
        self.waiting
            .entry(job.queue_name.clone())
            .or_default()
            .push_back(job.id);
        self.jobs.insert(job.id, job);
        Ok(())
    }

    /// Returns every expired lease of `queue` to the back of the line.
    fn reclaim_expired(&mut self, queue: &str, now: u64) {
        let mut expired: Vec<&mut Job> = self
            .jobs
            .values_mut()
            .filter(|job| job.queue_name == queue && job.lease_expired(now))
            .collect();
        // oldest lease first keeps reclaim order stable
        expired.sort_by_key(|job| (job.lease_until, job.created_at));

        let mut reclaimed = Vec::with_capacity(expired.len());
        for job in expired {
            if job.release_expired_lease().is_ok() {
                warn!(job_id = %job.id, queue = %queue, "Lease expired, job returned to waiting");
                reclaimed.push(job.id);
            }
        }
        if !reclaimed.is_empty() {
            self.waiting
                .entry(queue.to_string())
                .or_default()
                .extend(reclaimed);
        }
    }
}

/// Only `Waiting` jobs may be queued.
pub(super) fn require_waiting(job: &Job) -> StoreResult<()> {
    if job.state != JobState::Waiting {
        return Err(StoreError::InvalidRequest(format!(
            "Job {} must be waiting to be queued, found {}",
            job.id, job.state
        )));
    }
    Ok(())
}

// == Memory Job Store ==
/// Shared in-process job table.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    table: Arc<Mutex<JobTable>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn push(&self, job: Job) -> StoreResult<()> {
        self.table.lock().await.insert_waiting(job)
    }

    async fn push_unique(&self, dedupe_key: &str, job: Job) -> StoreResult<bool> {
        let mut table = self.table.lock().await;
        if table.claimed.contains_key(dedupe_key) {
            return Ok(false);
        }
        let claim = Claim {
            queue: job.queue_name.clone(),
            claimed_at: job.created_at,
        };
        table.insert_waiting(job)?;
        table.claimed.insert(dedupe_key.to_string(), claim);
        Ok(true)
    }

    async fn lease(&self, queue: &str, now_ms: u64, lease_ms: u64) -> StoreResult<Option<Job>> {
        let mut table = self.table.lock().await;
        table.reclaim_expired(queue, now_ms);

        let JobTable { jobs, waiting, .. } = &mut *table;
        let Some(order) = waiting.get_mut(queue) else {
            return Ok(None);
        };

        // Drop ids whose record is gone or no longer waiting
        order.retain(|id| jobs.get(id).is_some_and(|job| job.state == JobState::Waiting));

        let Some(position) = order
            .iter()
            .position(|id| jobs.get(id).is_some_and(|job| job.is_eligible(now_ms)))
        else {
            return Ok(None);
        };

        let Some(id) = order.remove(position) else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.start(now_ms, lease_ms)
            .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;
        debug!(job_id = %id, queue = %queue, "Job leased");
        Ok(Some(job.clone()))
    }

    async fn settle(&self, job: &Job, lease_id: Uuid) -> StoreResult<bool> {
        let mut table = self.table.lock().await;

        let held = table.jobs.get(&job.id).is_some_and(|stored| {
            stored.state == JobState::Active && stored.lease_id == Some(lease_id)
        });
        if !held {
            return Ok(false);
        }

        let requeue = job.state == JobState::Waiting;
        table.jobs.insert(job.id, job.clone());
        if requeue {
            table
                .waiting
                .entry(job.queue_name.clone())
                .or_default()
                .push_back(job.id);
        }
        Ok(true)
    }

    async fn get(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.table.lock().await.jobs.get(&id).cloned())
    }

    async fn remove(&self, id: JobId) -> StoreResult<bool> {
        Ok(self.table.lock().await.jobs.remove(&id).is_some())
    }

    async fn prune(&self, queue: &str, older_than_ms: u64) -> StoreResult<u64> {
        let mut table = self.table.lock().await;
        let before = table.jobs.len();
        table.jobs.retain(|_, job| {
            !(job.queue_name == queue
                && job.is_terminal()
                && job.finished_at.is_some_and(|at| at <= older_than_ms))
        });
        let pruned = (before - table.jobs.len()) as u64;

        let claims_before = table.claimed.len();
        table
            .claimed
            .retain(|_, claim| !(claim.queue == queue && claim.claimed_at <= older_than_ms));
        let dropped = claims_before - table.claimed.len();
        if dropped > 0 {
            debug!(queue = %queue, dropped, "Dedupe claims dropped");
        }
        Ok(pruned)
    }

    async fn counts(&self, queue: &str) -> StoreResult<QueueCounts> {
        let table = self.table.lock().await;
        let mut counts = QueueCounts::default();
        for job in table.jobs.values().filter(|job| job.queue_name == queue) {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Created => {}
            }
        }
        Ok(counts)
    }
}
