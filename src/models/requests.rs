//! Request DTOs for the service API
//!
//! Defines the structure of incoming HTTP request bodies.

use serde::Deserialize;

use crate::jobs::{Backoff, JobOptions};

/// Request body for POST /auth/login
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.username.trim().is_empty() || self.password.is_empty() {
            return Some("Username and password are required".to_string());
        }
        None
    }
}

/// Request body for POST /auth/register
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub name: String,
}

impl RegisterRequest {
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if !self.email.contains('@') {
            return Some("A valid email address is required".to_string());
        }
        if self.name.trim().is_empty() {
            return Some("Name cannot be empty".to_string());
        }
        None
    }
}

/// Request body for POST /api/jobs
///
/// # Fields
/// - `queueName`: target queue
/// - `type`: registered job type
/// - `data`: handler payload
/// - `maxAttempts`, `backoff`, `delayMs`: optional retry settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    pub queue_name: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Option<Backoff>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

impl JobSubmission {
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.queue_name.trim().is_empty() {
            return Some("queueName cannot be empty".to_string());
        }
        if self.job_type.trim().is_empty() {
            return Some("type cannot be empty".to_string());
        }
        if self.max_attempts == Some(0) {
            return Some("maxAttempts must be at least 1".to_string());
        }
        None
    }

    pub fn options(&self) -> JobOptions {
        let defaults = JobOptions::default();
        JobOptions {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            backoff: self.backoff.unwrap_or(defaults.backoff),
            delay_ms: self.delay_ms.unwrap_or(defaults.delay_ms),
        }
    }
}

/// Request body for POST /admin/cache/invalidate
#[derive(Debug, Clone, Deserialize)]
pub struct InvalidateRequest {
    /// Glob over cache keys; `*` clears everything
    pub pattern: String,
}

impl InvalidateRequest {
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.pattern.trim().is_empty() {
            return Some("Pattern cannot be empty".to_string());
        }
        None
    }
}

/// Query string of GET /api/news
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewsQuery {
    pub country: Option<String>,
    pub category: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::BackoffKind;

    #[test]
    fn test_job_submission_deserialize() {
        let json = r#"{
            "queueName": "notifications",
            "type": "welcome_notification",
            "data": {"email": "a@b.c", "name": "A"},
            "maxAttempts": 5,
            "backoff": {"kind": "fixed", "baseDelayMs": 1000}
        }"#;
        let req: JobSubmission = serde_json::from_str(json).unwrap();
        assert_eq!(req.queue_name, "notifications");
        assert_eq!(req.job_type, "welcome_notification");
        assert!(req.validate().is_none());

        let options = req.options();
        assert_eq!(options.max_attempts, 5);
        assert_eq!(options.backoff.kind, BackoffKind::Fixed);
        assert_eq!(options.backoff.base_delay_ms, 1000);
    }

    #[test]
    fn test_job_submission_defaults() {
        let json = r#"{"queueName": "q", "type": "t"}"#;
        let req: JobSubmission = serde_json::from_str(json).unwrap();
        assert!(req.data.is_null());
        assert_eq!(req.options(), JobOptions::default());
    }

    #[test]
    fn test_job_submission_rejects_zero_attempts() {
        let json = r#"{"queueName": "q", "type": "t", "maxAttempts": 0}"#;
        let req: JobSubmission = serde_json::from_str(json).unwrap();
        assert!(req.validate().is_some());
    }

    #[test]
    fn test_register_validation() {
        let ok = RegisterRequest {
            email: "ada@example.com".into(),
            name: "Ada".into(),
        };
        let bad = RegisterRequest {
            email: "ada".into(),
            name: "Ada".into(),
        };
        assert!(ok.validate().is_none());
        assert!(bad.validate().is_some());
    }

    #[test]
    fn test_invalidate_validation() {
        let req = InvalidateRequest {
            pattern: " ".to_string(),
        };
        assert!(req.validate().is_some());
    }
}
