//! Built-in background jobs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Job, JobError, JobHandler, JobQueue, JobResult};
use crate::clock::Clock;
use crate::store::StateStore;

/// Store key holding the latest analytics aggregate.
pub const ANALYTICS_KEY: &str = "analytics:latest";

/// Cached responses derived from the analytics aggregate.
const ANALYTICS_CACHE_PATTERN: &str = "cache:GET:/api/analytics*";

// == Collaborators ==
/// Outbound message delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Notifier that only writes the message to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        info!(to = %to, subject = %subject, body_len = body.len(), "Notification sent");
        Ok(())
    }
}

/// Read-only view of user records, used by the analytics job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub country: String,
    pub age: Option<u32>,
}

#[async_trait]
pub trait UserSource: Send + Sync {
    async fn all_users(&self) -> anyhow::Result<Vec<UserRecord>>;
}

/// Fixed in-memory user list.
#[derive(Debug, Clone, Default)]
pub struct StaticUserSource {
    users: Vec<UserRecord>,
}

impl StaticUserSource {
    pub fn new(users: Vec<UserRecord>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl UserSource for StaticUserSource {
    async fn all_users(&self) -> anyhow::Result<Vec<UserRecord>> {
        Ok(self.users.clone())
    }
}

// == Welcome Notification ==
/// Payload of a `welcome_notification` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub email: String,
    pub name: String,
}

/// Sends the greeting for a new registration.
pub struct WelcomeNotificationHandler {
    notifier: Arc<dyn Notifier>,
}

impl WelcomeNotificationHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl JobHandler for WelcomeNotificationHandler {
    async fn handle(&self, job: &Job) -> JobResult {
        let payload: WelcomePayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::fatal(format!("Malformed welcome payload: {}", e)))?;
        if !payload.email.contains('@') {
            return Err(JobError::fatal(format!(
                "Invalid recipient address '{}'",
                payload.email
            )));
        }

        let body = format!(
            "Hi {}, thanks for signing up! Your account is ready.",
            payload.name
        );
        self.notifier
            .send(&payload.email, "Welcome aboard", &body)
            .await
            .map_err(|e| JobError::retryable(e.to_string()))
    }
}

// == Analytics Aggregation ==
/// Aggregate over all user records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSnapshot {
    pub total_users: u64,
    pub by_country: BTreeMap<String, u64>,
    /// Mean over users with a known age
    pub average_age: Option<f64>,
    pub generated_at: DateTime<Utc>,
}

impl AnalyticsSnapshot {
    pub fn compute(users: &[UserRecord], generated_at: DateTime<Utc>) -> Self {
        let mut by_country = BTreeMap::new();
        for user in users {
            *by_country.entry(user.country.clone()).or_insert(0) += 1;
        }

        let ages: Vec<f64> = users.iter().filter_map(|u| u.age).map(f64::from).collect();
        let average_age = if ages.is_empty() {
            None
        } else {
            Some(ages.iter().sum::<f64>() / ages.len() as f64)
        };

        Self {
            total_users: users.len() as u64,
            by_country,
            average_age,
            generated_at,
        }
    }
}

/// Recomputes the analytics aggregate and drops stale cached responses.
pub struct AggregateAnalyticsHandler {
    users: Arc<dyn UserSource>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl AggregateAnalyticsHandler {
    pub fn new(users: Arc<dyn UserSource>, store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            users,
            store,
            clock,
        }
    }
}

#[async_trait]
impl JobHandler for AggregateAnalyticsHandler {
    async fn handle(&self, _job: &Job) -> JobResult {
        let users = self
            .users
            .all_users()
            .await
            .map_err(|e| JobError::retryable(format!("User source unavailable: {}", e)))?;

        let now = i64::try_from(self.clock.now_ms()).unwrap_or(i64::MAX);
        let generated_at = DateTime::from_timestamp_millis(now).unwrap_or_default();
        let snapshot = AnalyticsSnapshot::compute(&users, generated_at);
        let encoded = serde_json::to_string(&snapshot)
            .map_err(|e| JobError::fatal(format!("Cannot encode analytics: {}", e)))?;

        self.store
            .set(ANALYTICS_KEY, encoded, None)
            .await
            .map_err(|e| JobError::retryable(e.to_string()))?;
        let invalidated = self
            .store
            .delete_matching(ANALYTICS_CACHE_PATTERN)
            .await
            .map_err(|e| JobError::retryable(e.to_string()))?;

        info!(
            total_users = snapshot.total_users,
            countries = snapshot.by_country.len(),
            invalidated,
            "Analytics aggregated"
        );
        Ok(())
    }
}

// == Job Pruning ==
/// Deletes finished jobs older than the retention window.
pub struct PruneJobsHandler {
    queue: JobQueue,
    queues: Vec<String>,
    retention: Duration,
}

impl PruneJobsHandler {
    pub fn new(queue: JobQueue, queues: Vec<String>, retention: Duration) -> Self {
        Self {
            queue,
            queues,
            retention,
        }
    }
}

#[async_trait]
impl JobHandler for PruneJobsHandler {
    async fn handle(&self, _job: &Job) -> JobResult {
        let retention_ms = u64::try_from(self.retention.as_millis()).unwrap_or(u64::MAX);
        let mut removed = 0;
        for name in &self.queues {
            removed += self
                .queue
                .prune(name, retention_ms)
                .await
                .map_err(|e| JobError::retryable(e.to_string()))?;
        }
        info!(removed, "Job pruning finished");
        Ok(())
    }
}
