//! Job scheduling with cron triggers.
//!
//! Each tick enqueues at most one job per trigger occurrence. The occurrence
//! is identified by a period key, and the submission goes through
//! `JobStore::push_unique` keyed by `(trigger id, period key)`, so schedulers
//! in separate processes racing on the same tick produce a single job.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{JobId, JobOptions, JobQueue};
use crate::error::QueueError;

/// A recurring submission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    /// `<queue>:<job_type>:<cron>`; identical across instances
    pub id: String,
    pub cron_expression: String,
    pub queue_name: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
    pub last_fired_period: Option<String>,
}

impl Trigger {
    pub fn id_for(queue_name: &str, job_type: &str, cron_expression: &str) -> String {
        format!("{}:{}:{}", queue_name, job_type, cron_expression)
    }

    /// Dedup key for one occurrence of this trigger.
    pub fn dedupe_key(&self, period_key: &str) -> String {
        format!("trigger:{}:{}", self.id, period_key)
    }
}

/// Discretized occurrence time, truncated to the minute (UTC).
pub fn period_key(occurrence: &DateTime<Utc>) -> String {
    occurrence.format("%Y%m%d%H%M").to_string()
}

struct Entry {
    trigger: Trigger,
    cron: Cron,
    /// Next occurrence not yet submitted (Unix ms)
    next_fire_ms: Option<u64>,
}

/// Handle for a running scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Scheduler loop ended abnormally");
        }
    }
}

/// Cron-driven producer of recurring jobs.
pub struct Scheduler {
    queue: JobQueue,
    entries: Mutex<Vec<Entry>>,
}

impl Scheduler {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Registers a trigger with an empty payload and default options.
    pub async fn register_trigger(
        &self,
        cron_expression: &str,
        queue_name: &str,
        job_type: &str,
    ) -> Result<String, QueueError> {
        self.register_trigger_with(
            cron_expression,
            queue_name,
            job_type,
            serde_json::json!({}),
            JobOptions::default(),
        )
        .await
    }

    /// Registers a trigger; returns its id.
    ///
    /// The first occurrence considered is the first one strictly after now.
    /// Registering the same trigger twice keeps the first registration.
    pub async fn register_trigger_with(
        &self,
        cron_expression: &str,
        queue_name: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<String, QueueError> {
        let cron = Cron::new(cron_expression).parse().map_err(|e| {
            QueueError::InvalidSchedule(format!(
                "Invalid cron expression '{}': {}",
                cron_expression, e
            ))
        })?;

        let id = Trigger::id_for(queue_name, job_type, cron_expression);
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|entry| entry.trigger.id == id) {
            return Ok(id);
        }

        let now = self.queue.clock().now_ms();
        let next_fire_ms = next_after(&cron, now);
        entries.push(Entry {
            trigger: Trigger {
                id: id.clone(),
                cron_expression: cron_expression.to_string(),
                queue_name: queue_name.to_string(),
                job_type: job_type.to_string(),
                payload,
                options,
                last_fired_period: None,
            },
            cron,
            next_fire_ms,
        });
        info!(trigger = %id, next_fire_ms = ?next_fire_ms, "Trigger registered");
        Ok(id)
    }

    /// Snapshot of registered triggers.
    pub async fn triggers(&self) -> Vec<Trigger> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|entry| entry.trigger.clone())
            .collect()
    }

    /// Submits every due trigger once, for its latest due occurrence.
    ///
    /// Returns the ids of jobs this instance enqueued. Occurrences another
    /// instance already claimed are skipped silently. A trigger whose
    /// submission failed stays due and is retried on the next tick.
    pub async fn tick(&self, now_ms: u64) -> Vec<JobId> {
        let mut fired = Vec::new();
        let mut entries = self.entries.lock().await;

        for entry in entries.iter_mut() {
            let Some(due) = entry.next_fire_ms.filter(|due| *due <= now_ms) else {
                continue;
            };
            let occurrence = latest_due(&entry.cron, due, now_ms);
            let Some(at) = to_datetime(occurrence) else {
                continue;
            };
            let period = period_key(&at);
            let dedupe_key = entry.trigger.dedupe_key(&period);

            let result = self
                .queue
                .enqueue_unique(
                    &dedupe_key,
                    &entry.trigger.queue_name,
                    &entry.trigger.job_type,
                    entry.trigger.payload.clone(),
                    entry.trigger.options,
                )
                .await;

            match result {
                Ok(Some(id)) => {
                    info!(trigger = %entry.trigger.id, period = %period, job_id = %id, "Trigger fired");
                    fired.push(id);
                }
                Ok(None) => {
                    debug!(trigger = %entry.trigger.id, period = %period, "Period already claimed");
                }
                Err(e) => {
                    error!(trigger = %entry.trigger.id, period = %period, error = %e, "Trigger submission failed");
                    continue;
                }
            }

            entry.trigger.last_fired_period = Some(period);
            entry.next_fire_ms = next_after(&entry.cron, occurrence);
        }

        fired
    }

    /// Runs `tick` every `interval` until the handle is shut down.
    pub fn start(self: Arc<Self>, interval: Duration) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_secs = interval.as_secs(), "Scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = self.queue.clock().now_ms();
                        self.tick(now).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

fn to_datetime(ms: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(i64::try_from(ms).ok()?)
}

/// First occurrence strictly after `after_ms`.
fn next_after(cron: &Cron, after_ms: u64) -> Option<u64> {
    let start = to_datetime(after_ms)?;
    let next = cron.find_next_occurrence(&start, false).ok()?;
    u64::try_from(next.timestamp_millis()).ok()
}

/// Walks forward from the due occurrence to the last one at or before `now_ms`.
fn latest_due(cron: &Cron, due_ms: u64, now_ms: u64) -> u64 {
    let mut latest = due_ms;
    while let Some(next) = next_after(cron, latest) {
        if next > now_ms {
            break;
        }
        latest = next;
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::QueueConfig;
    use crate::store::MemoryJobStore;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> u64 {
        Utc.with_ymd_and_hms(2026, 1, 1, hour, minute, 0)
            .unwrap()
            .timestamp_millis() as u64
    }

    fn setup(start: u64) -> (Scheduler, JobQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let queue = JobQueue::new(
            Arc::new(MemoryJobStore::new()),
            clock.clone(),
            QueueConfig::default(),
        );
        (Scheduler::new(queue.clone()), queue, clock)
    }

    #[test]
    fn test_period_key_truncates_to_minute() {
        let occurrence = Utc.with_ymd_and_hms(2026, 3, 7, 14, 5, 59).unwrap();
        assert_eq!(period_key(&occurrence), "202603071405");
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() {
        let (scheduler, _, _) = setup(at(9, 0));
        let result = scheduler.register_trigger("not a cron", "maintenance", "x").await;
        assert!(matches!(result, Err(QueueError::InvalidSchedule(_))));
    }

    #[tokio::test]
    async fn test_fires_once_per_occurrence() {
        let (scheduler, queue, _) = setup(at(9, 30));
        scheduler
            .register_trigger("0 * * * *", "maintenance", "aggregate_analytics")
            .await
            .unwrap();

        assert!(scheduler.tick(at(9, 59)).await.is_empty());

        let fired = scheduler.tick(at(10, 0)).await;
        assert_eq!(fired.len(), 1);
        assert!(scheduler.tick(at(10, 0) + 15_000).await.is_empty());

        let job = queue.get(fired[0]).await.unwrap().unwrap();
        assert_eq!(job.job_type, "aggregate_analytics");

        let triggers = scheduler.triggers().await;
        assert_eq!(triggers[0].last_fired_period.as_deref(), Some("202601011000"));
    }

    #[tokio::test]
    async fn test_missed_occurrences_collapse_to_latest() {
        let (scheduler, queue, _) = setup(at(9, 30));
        scheduler
            .register_trigger("0 * * * *", "maintenance", "aggregate_analytics")
            .await
            .unwrap();

        let fired = scheduler.tick(at(13, 10)).await;

        assert_eq!(fired.len(), 1);
        assert_eq!(queue.counts("maintenance").await.unwrap().waiting, 1);
        let triggers = scheduler.triggers().await;
        assert_eq!(triggers[0].last_fired_period.as_deref(), Some("202601011300"));
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_ignored() {
        let (scheduler, _, _) = setup(at(9, 30));
        let a = scheduler.register_trigger("0 3 * * *", "maintenance", "prune_jobs").await.unwrap();
        let b = scheduler.register_trigger("0 3 * * *", "maintenance", "prune_jobs").await.unwrap();

        assert_eq!(a, b);
        assert_eq!(scheduler.triggers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_start_runs_ticks_until_shutdown() {
        let (scheduler, queue, clock) = setup(at(9, 59));
        scheduler
            .register_trigger("* * * * *", "maintenance", "aggregate_analytics")
            .await
            .unwrap();
        clock.set(at(10, 0));

        let handle = Arc::new(scheduler).start(Duration::from_millis(10));
        let mut waited = 0;
        while queue.counts("maintenance").await.unwrap().waiting == 0 && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        handle.shutdown().await;

        assert_eq!(queue.counts("maintenance").await.unwrap().waiting, 1);
    }
}
