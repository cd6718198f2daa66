//! Rate limit policies per route class.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Group of operations sharing one budget per identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteClass {
    /// Ordinary API traffic
    General,
    /// Login attempts
    Auth,
    /// Calls proxied to third-party providers
    Upstream,
}

impl RouteClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Auth => "auth",
            Self::Upstream => "upstream",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Window size and budget of one route class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub window: Duration,
    pub limit: u64,
    /// Only attempts reported as failed consume the budget
    pub count_only_failures: bool,
}

impl RatePolicy {
    pub fn new(window: Duration, limit: u64) -> Self {
        Self {
            window,
            limit,
            count_only_failures: false,
        }
    }

    pub fn counting_only_failures(mut self) -> Self {
        self.count_only_failures = true;
        self
    }

    /// 100 requests per 15 minutes.
    pub fn general() -> Self {
        Self::new(Duration::from_secs(15 * 60), 100)
    }

    /// 5 failed logins per 15 minutes.
    pub fn auth() -> Self {
        Self::new(Duration::from_secs(15 * 60), 5).counting_only_failures()
    }

    /// 10 upstream calls per minute.
    pub fn upstream() -> Self {
        Self::new(Duration::from_secs(60), 10)
    }

    pub fn for_class(class: RouteClass) -> Self {
        match class {
            RouteClass::General => Self::general(),
            RouteClass::Auth => Self::auth(),
            RouteClass::Upstream => Self::upstream(),
        }
    }

    pub(crate) fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }
}

/// What to answer when the store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    /// Admit every request
    #[default]
    Open,
    /// Reject every request
    Closed,
}

impl FromStr for FailMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown fail mode '{}'", other)),
        }
    }
}

/// Result of an attempt, as reported by the caller after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policies() {
        assert_eq!(RatePolicy::general().limit, 100);
        assert_eq!(RatePolicy::general().window, Duration::from_secs(900));
        assert!(RatePolicy::auth().count_only_failures);
        assert_eq!(RatePolicy::auth().limit, 5);
        assert_eq!(RatePolicy::upstream().window_ms(), 60_000);
        assert!(!RatePolicy::upstream().count_only_failures);
    }

    #[test]
    fn test_fail_mode_parsing() {
        assert_eq!("open".parse::<FailMode>(), Ok(FailMode::Open));
        assert_eq!(" Closed ".parse::<FailMode>(), Ok(FailMode::Closed));
        assert!("sideways".parse::<FailMode>().is_err());
        assert_eq!(FailMode::default(), FailMode::Open);
    }

    #[test]
    fn test_route_class_names() {
        assert_eq!(RouteClass::Auth.to_string(), "auth");
        assert_eq!(RouteClass::Upstream.as_str(), "upstream");
    }
}
