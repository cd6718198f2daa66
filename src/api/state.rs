//! Application State
//!
//! Every component the handlers, workers and scheduler share, built once
//! from configuration and injected collaborators.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::RequestCache;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::QueueError;
use crate::gateway::ExternalApiGateway;
use crate::jobs::{
    AggregateAnalyticsHandler, HandlerRegistry, JobQueue, LogNotifier, Notifier,
    PruneJobsHandler, QueueConfig, Scheduler, StaticUserSource, UserSource,
    WelcomeNotificationHandler, WorkerConfig, WorkerHandle, WorkerPool, AGGREGATE_ANALYTICS,
    MAINTENANCE_QUEUE, NOTIFICATIONS_QUEUE, PRUNE_JOBS, WELCOME_NOTIFICATION,
};
use crate::limiter::RateLimiter;
use crate::store::{JobStore, MemoryJobStore, MemoryStore, StateStore};

use super::identity::{CredentialVerifier, StaticCredentials};

/// Queues that get a worker pool.
pub const QUEUES: [&str; 2] = [NOTIFICATIONS_QUEUE, MAINTENANCE_QUEUE];

/// External systems this service talks to but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialVerifier>,
    pub users: Arc<dyn UserSource>,
    pub notifier: Arc<dyn Notifier>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            credentials: Arc::new(StaticCredentials::new()),
            users: Arc::new(StaticUserSource::new(Vec::new())),
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// Application state shared across handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub clock: Arc<dyn Clock>,
    /// Shared key-value store (analytics results live here)
    pub store: Arc<dyn StateStore>,
    pub cache: RequestCache,
    pub limiter: RateLimiter,
    pub gateway: ExternalApiGateway,
    pub jobs: JobQueue,
    pub registry: Arc<HandlerRegistry>,
    pub credentials: Arc<dyn CredentialVerifier>,
}

impl AppState {
    /// Wires every component over the given stores.
    ///
    /// # Arguments
    /// * `config` - Loaded configuration
    /// * `store` - Shared key-value store
    /// * `job_store` - Durable job store
    /// * `clock` - Time source for expiry, windows and backoff
    /// * `collaborators` - Credential check, user directory, notification channel
    pub fn new(
        config: &Config,
        store: Arc<dyn StateStore>,
        job_store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
    ) -> Result<Self, reqwest::Error> {
        let cache = RequestCache::new(store.clone());
        let limiter = RateLimiter::new(store.clone(), clock.clone(), config.rate_limit_fail_mode);
        let gateway = ExternalApiGateway::new(config.gateway.clone(), cache.clone())?;
        let jobs = JobQueue::new(
            job_store,
            clock.clone(),
            QueueConfig {
                lease_ms: config.job_lease_ms,
                ..QueueConfig::default()
            },
        );

        let registry = HandlerRegistry::new()
            .with(
                WELCOME_NOTIFICATION,
                Arc::new(WelcomeNotificationHandler::new(collaborators.notifier)),
            )
            .with(
                AGGREGATE_ANALYTICS,
                Arc::new(AggregateAnalyticsHandler::new(
                    collaborators.users,
                    store.clone(),
                    clock.clone(),
                )),
            )
            .with(
                PRUNE_JOBS,
                Arc::new(PruneJobsHandler::new(
                    jobs.clone(),
                    QUEUES.iter().map(|q| q.to_string()).collect(),
                    config.job_retention(),
                )),
            );

        Ok(Self {
            clock,
            store,
            cache,
            limiter,
            gateway,
            jobs,
            registry: Arc::new(registry),
            credentials: collaborators.credentials,
        })
    }

    /// In-memory stores on the system clock.
    pub fn from_config(config: &Config, collaborators: Collaborators) -> Result<Self, reqwest::Error> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(MemoryStore::new(config.max_entries, clock.clone()));
        Self::new(
            config,
            store,
            Arc::new(MemoryJobStore::new()),
            clock,
            collaborators,
        )
    }

    /// Scheduler carrying the default triggers.
    pub async fn scheduler(&self, config: &Config) -> Result<Scheduler, QueueError> {
        let scheduler = Scheduler::new(self.jobs.clone());
        scheduler
            .register_trigger(&config.analytics_cron, MAINTENANCE_QUEUE, AGGREGATE_ANALYTICS)
            .await?;
        scheduler
            .register_trigger(&config.prune_cron, MAINTENANCE_QUEUE, PRUNE_JOBS)
            .await?;
        Ok(scheduler)
    }

    /// Starts one worker pool per queue.
    pub fn start_workers(&self, config: &Config) -> Vec<WorkerHandle> {
        QUEUES
            .iter()
            .map(|queue| {
                WorkerPool::new(
                    WorkerConfig::new(*queue)
                        .with_concurrency(config.worker_concurrency)
                        .with_poll_interval_ms(config.worker_poll_ms),
                )
                .start(self.jobs.clone(), self.registry.clone())
            })
            .collect()
    }

    pub fn scheduler_tick(config: &Config) -> Duration {
        Duration::from_secs(config.scheduler_tick_secs.max(1))
    }
}
