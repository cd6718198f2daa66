//! Background Job Module
//!
//! Durable named queues with leased, retrying execution:
//!
//! - **Job**: record plus state machine (`job`)
//! - **Queue**: enqueue, lease, execute a registered handler, settle (`queue`)
//! - **Worker**: bounded pool of executions per queue (`worker`)
//! - **Scheduler**: cron triggers with one submission per period (`scheduler`)
//! - **Built-in jobs**: welcome notification, analytics aggregation, job pruning (`builtin`)
//!
//! ```text
//! Scheduler ──push_unique──┐
//!                          ▼
//! enqueue ──push──▶ JobStore ──lease──▶ WorkerPool ──handler──▶ settle
//! ```

pub mod builtin;
pub mod job;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use builtin::{
    AggregateAnalyticsHandler, AnalyticsSnapshot, LogNotifier, Notifier, PruneJobsHandler,
    StaticUserSource, UserRecord, UserSource, WelcomeNotificationHandler, WelcomePayload,
    ANALYTICS_KEY,
};
pub use job::{
    Backoff, BackoffKind, Job, JobError, JobId, JobOptions, JobResult, JobState, Transition,
};
pub use queue::{FnHandler, HandlerRegistry, JobHandler, JobQueue, QueueConfig};
pub use scheduler::{period_key, Scheduler, SchedulerHandle, Trigger};
pub use worker::{WorkerConfig, WorkerHandle, WorkerPool, WorkerStats};

// == Queue Names ==
/// Queue for user-facing side effects
pub const NOTIFICATIONS_QUEUE: &str = "notifications";

/// Queue for periodic housekeeping
pub const MAINTENANCE_QUEUE: &str = "maintenance";

// == Job Types ==
pub const WELCOME_NOTIFICATION: &str = "welcome_notification";
pub const AGGREGATE_ANALYTICS: &str = "aggregate_analytics";
pub const PRUNE_JOBS: &str = "prune_jobs";
