//! Job Module
//!
//! The job record and its state machine:
//!
//! ```text
//! Created -> Waiting -> Active -> Completed
//!               ^          |
//!               +----------+ (retryable failure, attempts < max)
//!                          |
//!                          +--> Failed (attempts == max, or fatal error)
//! ```
//!
//! `Completed` and `Failed` are terminal; every transition method refuses to
//! leave them.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::QueueError;

// == Job Id ==
/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// == Job State ==
/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Built but not yet persisted
    Created,
    /// Persisted, eligible once `run_at` has passed
    Waiting,
    /// Leased by a worker
    Active,
    /// Handler succeeded
    Completed,
    /// Retry budget exhausted or fatal error; dead-lettered
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

// == Backoff ==
/// Shape of the delay curve between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Delay policy applied after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    pub kind: BackoffKind,
    pub base_delay_ms: u64,
}

impl Backoff {
    pub fn fixed(base_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay_ms,
        }
    }

    pub fn exponential(base_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms,
        }
    }

    /// Delay before the next run after the `attempts`-th failure (1-based).
    ///
    /// Fixed: `base`. Exponential: `base * 2^(attempts - 1)`, saturating.
    pub fn delay_ms(&self, attempts: u32) -> u64 {
        match self.kind {
            BackoffKind::Fixed => self.base_delay_ms,
            BackoffKind::Exponential => {
                let exponent = attempts.saturating_sub(1).min(63);
                self.base_delay_ms.saturating_mul(1u64 << exponent)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(2_000)
    }
}

// == Job Options ==
/// Per-submission retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Initial delay before the job first becomes eligible
    pub delay_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            delay_ms: 0,
        }
    }
}

impl JobOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

// == Job Error ==
/// Failure reported by a job handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Transient; retried according to the job's backoff
    #[error("{0}")]
    Retryable(String),

    /// Permanent (e.g. malformed payload); the job fails immediately
    #[error("{0}")]
    Fatal(String),
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Result type for job handlers.
pub type JobResult = std::result::Result<(), JobError>;

// == Transition ==
/// Where a job went after one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Completed,
    Retrying { run_at_ms: u64 },
    Failed,
}

// == Job ==
/// A unit of background work and its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub state: JobState,
    pub created_at: u64,
    /// Earliest time the job may be leased (Unix ms)
    pub scheduled_at: u64,
    pub lease_id: Option<Uuid>,
    pub lease_until: Option<u64>,
    pub finished_at: Option<u64>,
    pub last_error: Option<String>,
}

impl Job {
    // == Constructor ==
    /// Builds a `Created` job; it is not visible to workers until persisted.
    pub fn new(
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: JobOptions,
        now: u64,
    ) -> Result<Self, QueueError> {
        let queue_name = queue_name.into();
        let job_type = job_type.into();

        if queue_name.trim().is_empty() {
            return Err(QueueError::InvalidJob("Queue name cannot be empty".to_string()));
        }
        if job_type.trim().is_empty() {
            return Err(QueueError::InvalidJob("Job type cannot be empty".to_string()));
        }
        if options.max_attempts == 0 {
            return Err(QueueError::InvalidJob(
                "maxAttempts must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            id: JobId::new(),
            queue_name,
            job_type,
            payload,
            attempts: 0,
            max_attempts: options.max_attempts,
            backoff: options.backoff,
            state: JobState::Created,
            created_at: now,
            scheduled_at: now.saturating_add(options.delay_ms),
            lease_id: None,
            lease_until: None,
            finished_at: None,
            last_error: None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether a `Waiting` job may be leased at `now`.
    pub fn is_eligible(&self, now: u64) -> bool {
        self.state == JobState::Waiting && self.scheduled_at <= now
    }

    /// Whether an `Active` job's lease has run out at `now`.
    pub fn lease_expired(&self, now: u64) -> bool {
        self.state == JobState::Active && self.lease_until.is_some_and(|until| until <= now)
    }

    // == Transitions ==
    /// `Created -> Waiting`.
    pub fn mark_waiting(&mut self) -> Result<(), QueueError> {
        self.expect_state(JobState::Created, JobState::Waiting)?;
        self.state = JobState::Waiting;
        Ok(())
    }

    /// `Waiting -> Active` under a fresh lease ending at `now + lease_ms`.
    pub fn start(&mut self, now: u64, lease_ms: u64) -> Result<(), QueueError> {
        self.start_with_lease(Uuid::new_v4(), now, lease_ms)
    }

    /// Like [`start`](Self::start) under a lease id the store already handed out.
    pub fn start_with_lease(
        &mut self,
        lease_id: Uuid,
        now: u64,
        lease_ms: u64,
    ) -> Result<(), QueueError> {
        self.expect_state(JobState::Waiting, JobState::Active)?;
        self.state = JobState::Active;
        self.lease_id = Some(lease_id);
        self.lease_until = Some(now.saturating_add(lease_ms));
        Ok(())
    }

    /// `Active -> Waiting` after the holder vanished; attempts are unchanged.
    pub fn release_expired_lease(&mut self) -> Result<(), QueueError> {
        self.expect_state(JobState::Active, JobState::Waiting)?;
        self.state = JobState::Waiting;
        self.lease_id = None;
        self.lease_until = None;
        Ok(())
    }

    /// `Active -> Completed`.
    pub fn complete(&mut self, now: u64) -> Result<Transition, QueueError> {
        self.expect_state(JobState::Active, JobState::Completed)?;
        self.state = JobState::Completed;
        self.finished_at = Some(now);
        self.lease_id = None;
        self.lease_until = None;
        Ok(Transition::Completed)
    }

    /// `Active -> Waiting` (retry with backoff) or `Active -> Failed`.
    pub fn fail(&mut self, error: &JobError, now: u64) -> Result<Transition, QueueError> {
        if self.state != JobState::Active {
            return Err(QueueError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: JobState::Failed,
            });
        }

        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.last_error = Some(error.to_string());
        self.lease_id = None;
        self.lease_until = None;

        if !error.is_retryable() || self.attempts >= self.max_attempts {
            self.state = JobState::Failed;
            self.finished_at = Some(now);
            return Ok(Transition::Failed);
        }

        let run_at_ms = now.saturating_add(self.backoff.delay_ms(self.attempts));
        self.state = JobState::Waiting;
        self.scheduled_at = run_at_ms;
        Ok(Transition::Retrying { run_at_ms })
    }

    fn expect_state(&self, from: JobState, to: JobState) -> Result<(), QueueError> {
        if self.state == from {
            Ok(())
        } else {
            Err(QueueError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            })
        }
    }
}
