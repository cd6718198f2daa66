//! Configuration Module
//!
//! Handles loading and managing service configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::gateway::GatewayConfig;
use crate::limiter::FailMode;

/// Service configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port
    pub server_port: u16,
    /// Redis URL of the shared store; in-process store when unset
    pub store_url: Option<String>,
    /// Prefix of every key the service writes to the shared store
    pub store_prefix: String,
    /// Maximum number of entries the in-process store holds
    pub max_entries: usize,
    /// Background expiry sweep interval in seconds
    pub cleanup_interval: u64,
    /// What the rate limiter answers when the store is unreachable
    pub rate_limit_fail_mode: FailMode,
    /// Concurrent jobs per queue
    pub worker_concurrency: usize,
    /// Idle poll interval of the worker pools in milliseconds
    pub worker_poll_ms: u64,
    /// Job lease (visibility timeout) in milliseconds
    pub job_lease_ms: u64,
    /// Scheduler tick interval in seconds
    pub scheduler_tick_secs: u64,
    /// Cron expression of the analytics aggregation
    pub analytics_cron: String,
    /// Cron expression of the job pruning
    pub prune_cron: String,
    /// How long finished jobs are kept, in hours
    pub job_retention_hours: u64,
    /// Upstream provider endpoints
    pub gateway: GatewayConfig,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `STORE_URL` - Redis URL, e.g. `redis://localhost:6379` (default: unset, in-process store)
    /// - `STORE_PREFIX` - Key prefix in the shared store (default: gatekeep)
    /// - `MAX_ENTRIES` - Maximum in-process store entries (default: 10000)
    /// - `CLEANUP_INTERVAL` - Expiry sweep frequency in seconds (default: 1)
    /// - `UPSTREAM_TIMEOUT_MS` - Provider call timeout (default: 5000)
    /// - `RATE_LIMIT_FAIL_MODE` - `open` or `closed` (default: open)
    /// - `WORKER_CONCURRENCY` - Jobs in flight per queue (default: 2)
    /// - `WORKER_POLL_MS` - Idle poll interval (default: 500)
    /// - `JOB_LEASE_MS` - Job lease length (default: 30000)
    /// - `SCHEDULER_TICK_SECS` - Scheduler tick (default: 15)
    /// - `ANALYTICS_CRON` - (default: `0 * * * *`)
    /// - `PRUNE_CRON` - (default: `0 3 * * *`)
    /// - `JOB_RETENTION_HOURS` - (default: 24)
    /// - `WEATHER_API_URL`, `WEATHER_API_KEY`, `NEWS_API_URL`, `NEWS_API_KEY`,
    ///   `EXCHANGE_API_URL`, `GITHUB_API_URL`, `QUOTE_API_URL` - provider endpoints
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let gateway_defaults = defaults.gateway.clone();

        Self {
            server_port: parsed("SERVER_PORT", defaults.server_port),
            store_url: env::var("STORE_URL").ok().filter(|v| !v.trim().is_empty()),
            store_prefix: text("STORE_PREFIX", defaults.store_prefix),
            max_entries: parsed("MAX_ENTRIES", defaults.max_entries),
            cleanup_interval: parsed("CLEANUP_INTERVAL", defaults.cleanup_interval),
            rate_limit_fail_mode: parsed("RATE_LIMIT_FAIL_MODE", defaults.rate_limit_fail_mode),
            worker_concurrency: parsed("WORKER_CONCURRENCY", defaults.worker_concurrency),
            worker_poll_ms: parsed("WORKER_POLL_MS", defaults.worker_poll_ms),
            job_lease_ms: parsed("JOB_LEASE_MS", defaults.job_lease_ms),
            scheduler_tick_secs: parsed("SCHEDULER_TICK_SECS", defaults.scheduler_tick_secs),
            analytics_cron: text("ANALYTICS_CRON", defaults.analytics_cron),
            prune_cron: text("PRUNE_CRON", defaults.prune_cron),
            job_retention_hours: parsed("JOB_RETENTION_HOURS", defaults.job_retention_hours),
            gateway: GatewayConfig {
                timeout: Duration::from_millis(parsed(
                    "UPSTREAM_TIMEOUT_MS",
                    gateway_defaults.timeout.as_millis() as u64,
                )),
                weather_url: text("WEATHER_API_URL", gateway_defaults.weather_url),
                weather_api_key: text("WEATHER_API_KEY", gateway_defaults.weather_api_key),
                news_url: text("NEWS_API_URL", gateway_defaults.news_url),
                news_api_key: text("NEWS_API_KEY", gateway_defaults.news_api_key),
                exchange_url: text("EXCHANGE_API_URL", gateway_defaults.exchange_url),
                github_url: text("GITHUB_API_URL", gateway_defaults.github_url),
                quote_url: text("QUOTE_API_URL", gateway_defaults.quote_url),
            },
        }
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_hours * 3600)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 3000,
            store_url: None,
            store_prefix: "gatekeep".to_string(),
            max_entries: 10_000,
            cleanup_interval: 1,
            rate_limit_fail_mode: FailMode::Open,
            worker_concurrency: 2,
            worker_poll_ms: 500,
            job_lease_ms: 30_000,
            scheduler_tick_secs: 15,
            analytics_cron: "0 * * * *".to_string(),
            prune_cron: "0 3 * * *".to_string(),
            job_retention_hours: 24,
            gateway: GatewayConfig::default(),
        }
    }
}

fn parsed<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn text(name: &str, default: String) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}
