//! Job worker pool for concurrent job execution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use super::{HandlerRegistry, JobQueue, Transition};
use crate::error::QueueError;

/// Configuration for one queue's worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue this pool works
    pub queue_name: String,
    /// Maximum concurrent job executions
    pub concurrency: usize,
    /// Sleep between polls when the queue has nothing eligible (milliseconds)
    pub poll_interval_ms: u64,
}

impl WorkerConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            concurrency: 2,
            poll_interval_ms: 500,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }
}

/// Counters for a worker pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Jobs whose outcome was recorded
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    /// Failures that were scheduled for another attempt
    pub retried: Arc<AtomicU64>,
    /// Failures that ended the job
    pub failed: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    fn record(&self, transition: Transition) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match transition {
            Transition::Completed => &self.succeeded,
            Transition::Retrying { .. } => &self.retried,
            Transition::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle for controlling a running pool.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signals the pool to stop leasing and waits for in-flight jobs.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Worker dispatcher ended abnormally");
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}

/// Bounded pool of executions over one queue.
pub struct WorkerPool {
    config: WorkerConfig,
    stats: WorkerStats,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            stats: WorkerStats::new(),
        }
    }

    /// Starts the dispatcher, returning a handle for control.
    ///
    /// The dispatcher takes a permit before each lease, so at most
    /// `concurrency` jobs of this pool are `Active` at once.
    pub fn start(self, queue: JobQueue, registry: Arc<HandlerRegistry>) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let config = self.config;
        let pool_stats = self.stats;

        let task = tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(config.concurrency));
            let poll_interval = Duration::from_millis(config.poll_interval_ms);

            tracing::info!(
                queue = %config.queue_name,
                concurrency = config.concurrency,
                "Worker pool started"
            );

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let permit = tokio::select! {
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                let leased = match queue.lease_next(&config.queue_name).await {
                    Ok(leased) => leased,
                    Err(e) => {
                        tracing::warn!(queue = %config.queue_name, error = %e, "Lease failed");
                        None
                    }
                };

                let Some(job) = leased else {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                };

                let queue = queue.clone();
                let registry = registry.clone();
                let stats = pool_stats.clone();
                tokio::spawn(async move {
                    stats.active.fetch_add(1, Ordering::Relaxed);
                    match queue.run_leased(job, &registry).await {
                        Ok(transition) => stats.record(transition),
                        Err(QueueError::LeaseLost(_)) => {}
                        Err(e) => tracing::error!(error = %e, "Job bookkeeping failed"),
                    }
                    stats.active.fetch_sub(1, Ordering::Relaxed);
                    drop(permit);
                });
            }

            tracing::info!(queue = %config.queue_name, "Worker pool draining");
            let in_flight = u32::try_from(config.concurrency).unwrap_or(u32::MAX);
            let _ = permits.acquire_many(in_flight).await;
            tracing::info!(queue = %config.queue_name, "Worker pool stopped");
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            stats,
            task,
        }
    }
}
