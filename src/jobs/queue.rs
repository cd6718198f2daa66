//! Job Queue Module
//!
//! Submission and the lease-execute-settle cycle. The queue owns no state of
//! its own; every record lives in the `JobStore` so any number of processes
//! can enqueue and work the same queues.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobError, JobId, JobOptions, JobResult, Transition};
use crate::clock::Clock;
use crate::error::QueueError;
use crate::store::{JobStore, QueueCounts};

// == Handler Trait ==
/// Work function for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobResult;
}

/// Adapts an async closure into a `JobHandler`.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> JobResult {
        (self.0)(job.clone()).await
    }
}

// == Handler Registry ==
/// Maps job types to their handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `job_type`, replacing any previous one.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.register(job_type, handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(job_type)
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }
}

// == Queue Config ==
/// Queue-wide execution settings.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// How long a leased job stays invisible to other workers
    pub lease_ms: u64,
    /// Delete completed jobs instead of keeping them for inspection
    pub remove_on_complete: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ms: 30_000,
            remove_on_complete: false,
        }
    }
}

// == Job Queue ==
/// Handle over the durable job store.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // == Submission ==
    /// Persists a new job and returns its id once the store has it.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let job = self.build(queue_name, job_type, payload, options)?;
        let id = job.id;
        self.store.push(job).await?;
        info!(job_id = %id, queue = %queue_name, job_type = %job_type, "Job enqueued");
        Ok(id)
    }

    /// Persists a new job unless `dedupe_key` was already used.
    ///
    /// Returns `None` when another submission claimed the key first.
    pub async fn enqueue_unique(
        &self,
        dedupe_key: &str,
        queue_name: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Option<JobId>, QueueError> {
        let job = self.build(queue_name, job_type, payload, options)?;
        let id = job.id;
        if self.store.push_unique(dedupe_key, job).await? {
            info!(job_id = %id, queue = %queue_name, dedupe_key = %dedupe_key, "Job enqueued");
            Ok(Some(id))
        } else {
            debug!(queue = %queue_name, dedupe_key = %dedupe_key, "Duplicate submission skipped");
            Ok(None)
        }
    }

    fn build(
        &self,
        queue_name: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        let mut job = Job::new(queue_name, job_type, payload, options, self.clock.now_ms())?;
        job.mark_waiting()?;
        Ok(job)
    }

    // == Execution ==
    /// Leases the next eligible job of `queue_name`.
    pub async fn lease_next(&self, queue_name: &str) -> Result<Option<Job>, QueueError> {
        let now = self.clock.now_ms();
        Ok(self.store.lease(queue_name, now, self.config.lease_ms).await?)
    }

    /// Runs the handler for a leased job and records the outcome.
    ///
    /// A job type with no registered handler fails terminally. Returns
    /// `QueueError::LeaseLost` when the lease ran out and another worker
    /// took the job while this one was running.
    pub async fn run_leased(
        &self,
        mut job: Job,
        registry: &HandlerRegistry,
    ) -> Result<Transition, QueueError> {
        let Some(lease_id) = job.lease_id else {
            return Err(QueueError::InvalidTransition {
                id: job.id,
                from: job.state,
                to: super::JobState::Completed,
            });
        };
        let attempt = job.attempts + 1;
        debug!(job_id = %job.id, job_type = %job.job_type, attempt, "Running job");

        let outcome = match registry.get(&job.job_type) {
            Some(handler) => handler.handle(&job).await,
            None => Err(JobError::fatal(format!(
                "No handler registered for job type '{}'",
                job.job_type
            ))),
        };

        let now = self.clock.now_ms();
        let transition = match &outcome {
            Ok(()) => job.complete(now)?,
            Err(err) => job.fail(err, now)?,
        };

        if !self.store.settle(&job, lease_id).await? {
            warn!(job_id = %job.id, queue = %job.queue_name, "Lease lost, result discarded");
            return Err(QueueError::LeaseLost(job.id));
        }

        match transition {
            Transition::Completed => {
                info!(job_id = %job.id, queue = %job.queue_name, attempt, "Job completed");
                if self.config.remove_on_complete {
                    self.store.remove(job.id).await?;
                }
            }
            Transition::Retrying { run_at_ms } => {
                warn!(
                    job_id = %job.id,
                    queue = %job.queue_name,
                    attempt,
                    run_at_ms,
                    error = job.last_error.as_deref().unwrap_or_default(),
                    "Job failed, retry scheduled"
                );
            }
            Transition::Failed => {
                error!(
                    job_id = %job.id,
                    queue = %job.queue_name,
                    attempt,
                    error = job.last_error.as_deref().unwrap_or_default(),
                    "Job failed permanently"
                );
            }
        }

        Ok(transition)
    }

    /// One lease-execute-settle cycle; `None` when nothing is eligible.
    pub async fn process_next(
        &self,
        queue_name: &str,
        registry: &HandlerRegistry,
    ) -> Result<Option<Transition>, QueueError> {
        match self.lease_next(queue_name).await? {
            Some(job) => self.run_leased(job, registry).await.map(Some),
            None => Ok(None),
        }
    }

    // == Inspection ==
    pub async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn counts(&self, queue_name: &str) -> Result<QueueCounts, QueueError> {
        Ok(self.store.counts(queue_name).await?)
    }

    /// Deletes terminal jobs of `queue_name` finished more than `retention_ms` ago.
    pub async fn prune(&self, queue_name: &str, retention_ms: u64) -> Result<u64, QueueError> {
        let cutoff = self.clock.now_ms().saturating_sub(retention_ms);
        let removed = self.store.prune(queue_name, cutoff).await?;
        if removed > 0 {
            info!(queue = %queue_name, removed, "Pruned finished jobs");
        }
        Ok(removed)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::{Backoff, JobState};
    use crate::store::MemoryJobStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn setup(config: QueueConfig) -> (JobQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let queue = JobQueue::new(Arc::new(MemoryJobStore::new()), clock.clone(), config);
        (queue, clock)
    }

    fn ok_registry(job_type: &str) -> HandlerRegistry {
        HandlerRegistry::new().with(
            job_type,
            Arc::new(FnHandler(|_job: Job| async { JobResult::Ok(()) })),
        )
    }

    #[tokio::test]
    async fn test_enqueue_is_visible_immediately() {
        let (queue, _) = setup(QueueConfig::default());

        let id = queue
            .enqueue("emails", "welcome", json!({"to": "a@b.c"}), JobOptions::default())
            .await
            .unwrap();

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.payload["to"], "a@b.c");
    }

    #[tokio::test]
    async fn test_process_next_completes_job() {
        let (queue, _) = setup(QueueConfig::default());
        let id = queue
            .enqueue("emails", "welcome", json!({}), JobOptions::default())
            .await
            .unwrap();

        let transition = queue.process_next("emails", &ok_registry("welcome")).await.unwrap();

        assert_eq!(transition, Some(Transition::Completed));
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(queue.process_next("emails", &ok_registry("welcome")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_job_type_fails_terminally() {
        let (queue, _) = setup(QueueConfig::default());
        let id = queue
            .enqueue("emails", "mystery", json!({}), JobOptions::default())
            .await
            .unwrap();

        let transition = queue.process_next("emails", &ok_registry("welcome")).await.unwrap();

        assert_eq!(transition, Some(Transition::Failed));
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().contains("mystery"));
    }

    #[tokio::test]
    async fn test_retries_follow_exponential_backoff() {
        let (queue, clock) = setup(QueueConfig::default());
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let registry = HandlerRegistry::new().with(
            "flaky",
            Arc::new(FnHandler(move |_job: Job| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    JobResult::Err(JobError::retryable("upstream down"))
                }
            })),
        );
        let options = JobOptions::default()
            .with_max_attempts(3)
            .with_backoff(Backoff::exponential(2_000));
        let id = queue.enqueue("work", "flaky", json!({}), options).await.unwrap();

        let first = queue.process_next("work", &registry).await.unwrap();
        assert_eq!(first, Some(Transition::Retrying { run_at_ms: 2_000 }));

        clock.set(1_999);
        assert!(queue.process_next("work", &registry).await.unwrap().is_none());

        clock.set(2_000);
        let second = queue.process_next("work", &registry).await.unwrap();
        assert_eq!(second, Some(Transition::Retrying { run_at_ms: 6_000 }));

        clock.set(5_999);
        assert!(queue.process_next("work", &registry).await.unwrap().is_none());

        clock.set(6_000);
        let third = queue.process_next("work", &registry).await.unwrap();
        assert_eq!(third, Some(Transition::Failed));

        clock.advance(Duration::from_secs(3600));
        assert!(queue.process_next("work", &registry).await.unwrap().is_none());

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("upstream down"));
    }

    #[tokio::test]
    async fn test_remove_on_complete_deletes_record() {
        let (queue, _) = setup(QueueConfig {
            remove_on_complete: true,
            ..QueueConfig::default()
        });
        let id = queue
            .enqueue("emails", "welcome", json!({}), JobOptions::default())
            .await
            .unwrap();

        queue.process_next("emails", &ok_registry("welcome")).await.unwrap();

        assert!(queue.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_discards_late_result() {
        let (queue, clock) = setup(QueueConfig {
            lease_ms: 1_000,
            ..QueueConfig::default()
        });
        let id = queue
            .enqueue("emails", "welcome", json!({}), JobOptions::default())
            .await
            .unwrap();

        let slow = queue.lease_next("emails").await.unwrap().unwrap();
        clock.advance(Duration::from_millis(1_000));
        let rescued = queue.lease_next("emails").await.unwrap().unwrap();
        assert_eq!(rescued.id, id);

        let late = queue.run_leased(slow, &ok_registry("welcome")).await;
        assert!(matches!(late, Err(QueueError::LeaseLost(lost)) if lost == id));

        let done = queue.run_leased(rescued, &ok_registry("welcome")).await.unwrap();
        assert_eq!(done, Transition::Completed);
    }

    #[tokio::test]
    async fn test_enqueue_unique_skips_duplicates() {
        let (queue, _) = setup(QueueConfig::default());

        let first = queue
            .enqueue_unique("k", "maintenance", "prune", json!({}), JobOptions::default())
            .await
            .unwrap();
        let second = queue
            .enqueue_unique("k", "maintenance", "prune", json!({}), JobOptions::default())
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(queue.counts("maintenance").await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_prune_uses_retention_window() {
        let (queue, clock) = setup(QueueConfig::default());
        queue
            .enqueue("emails", "welcome", json!({}), JobOptions::default())
            .await
            .unwrap();
        queue.process_next("emails", &ok_registry("welcome")).await.unwrap();

        clock.set(59_999);
        assert_eq!(queue.prune("emails", 60_000).await.unwrap(), 0);
        clock.set(60_000);
        assert_eq!(queue.prune("emails", 60_000).await.unwrap(), 1);
    }
}
