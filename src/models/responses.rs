//! Response DTOs for the service API
//!
//! Defines the structure of outgoing HTTP response bodies.

use serde::Serialize;

use crate::cache::Cached;
use crate::jobs::JobId;
use crate::store::StoreStats;

/// Response body for provider endpoints (GET /api/weather/:city etc.)
#[derive(Debug, Clone, Serialize)]
pub struct ProviderResponse<T> {
    pub data: T,
    /// Whether the data was served from cache
    pub cached: bool,
}

impl<T> From<Cached<T>> for ProviderResponse<T> {
    fn from(cached: Cached<T>) -> Self {
        Self {
            data: cached.data,
            cached: cached.from_cache,
        }
    }
}

/// Response body for job submissions (202 Accepted)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: JobId,
}

/// Response body for POST /auth/login
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub message: String,
    pub user_id: String,
}

impl LoginResponse {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            message: "Login successful".to_string(),
            user_id: user_id.into(),
        }
    }
}

/// Response body for POST /admin/cache/invalidate
#[derive(Debug, Clone, Serialize)]
pub struct InvalidateResponse {
    pub pattern: String,
    /// Number of entries removed
    pub count: u64,
}

/// Response body for the stats endpoint (GET /admin/cache/stats)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of evictions
    pub evictions: u64,
    /// Entries dropped because their TTL passed
    pub expired: u64,
    /// Current number of entries in the store
    pub total_entries: usize,
    /// Hit rate (hits / (hits + misses))
    pub hit_rate: f64,
}

impl From<StoreStats> for StatsResponse {
    fn from(stats: StoreStats) -> Self {
        Self {
            hit_rate: stats.hit_rate(),
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            expired: stats.expired,
            total_entries: stats.total_entries,
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}
