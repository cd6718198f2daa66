//! API Handlers
//!
//! HTTP request handlers for each endpoint. Provider routes return
//! `{data, cached}` plus an `x-cache` header; job routes answer with the
//! id or record of the job.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::{AppError, Result};
use crate::jobs::{
    AnalyticsSnapshot, Job, JobId, JobOptions, ANALYTICS_KEY, NOTIFICATIONS_QUEUE,
    WELCOME_NOTIFICATION,
};
use crate::cache::Cached;
use crate::limiter::{Outcome, RouteClass};
use crate::models::{
    HealthResponse, InvalidateRequest, InvalidateResponse, JobAccepted, JobSubmission,
    LoginRequest, LoginResponse, NewsQuery, ProviderResponse, RegisterRequest, StatsResponse,
};

use super::identity::Identity;
use super::middleware::mark_cache_status;
use super::state::AppState;

const DEFAULT_NEWS_COUNTRY: &str = "us";
const DEFAULT_NEWS_CATEGORY: &str = "general";

fn provider_response<T: serde::Serialize>(cached: Cached<T>) -> Response {
    let from_cache = cached.from_cache;
    let mut response = Json(ProviderResponse::from(cached)).into_response();
    mark_cache_status(&mut response, from_cache);
    response
}

fn required(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidRequest(format!("{} cannot be empty", what)));
    }
    Ok(())
}

// == Health ==
/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

// == Providers ==
/// Handler for GET /api/weather/:city
pub async fn weather_handler(
    State(state): State<AppState>,
    Path(city): Path<String>,
) -> Result<Response> {
    required(&city, "City")?;
    let report = state.gateway.fetch_weather(&city).await?;
    Ok(provider_response(report))
}

/// Handler for GET /api/news?country=&category=
pub async fn news_handler(
    State(state): State<AppState>,
    Query(query): Query<NewsQuery>,
) -> Result<Response> {
    let country = query.country.as_deref().unwrap_or(DEFAULT_NEWS_COUNTRY);
    let category = query.category.as_deref().unwrap_or(DEFAULT_NEWS_CATEGORY);
    let feed = state.gateway.fetch_news(country, category).await?;
    Ok(provider_response(feed))
}

/// Handler for GET /api/exchange/:base
pub async fn exchange_handler(
    State(state): State<AppState>,
    Path(base): Path<String>,
) -> Result<Response> {
    let rates = state.gateway.fetch_exchange_rates(&base).await?;
    Ok(provider_response(rates))
}

/// Handler for GET /api/github/:username
pub async fn github_handler(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response> {
    required(&username, "Username")?;
    let profile = state.gateway.fetch_github_profile(&username).await?;
    Ok(provider_response(profile))
}

/// Handler for GET /api/quote
pub async fn quote_handler(State(state): State<AppState>) -> Result<Response> {
    let quote = state.gateway.fetch_quote().await?;
    Ok(provider_response(quote))
}

// == Analytics ==
/// Handler for GET /api/analytics
///
/// Serves the latest aggregate written by the analytics job.
pub async fn analytics_handler(State(state): State<AppState>) -> Result<Json<AnalyticsSnapshot>> {
    let raw = state
        .store
        .get(ANALYTICS_KEY)
        .await?
        .ok_or_else(|| AppError::NotFound("Analytics have not been computed yet".to_string()))?;

    let snapshot = serde_json::from_str(&raw)
        .map_err(|e| AppError::Internal(format!("Corrupt analytics snapshot: {}", e)))?;
    Ok(Json(snapshot))
}

// == Authentication ==
/// Handler for POST /auth/login
///
/// Only failed attempts consume the caller's authentication budget.
pub async fn login_handler(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<LoginRequest>,
) -> Result<Response> {
    if let Some(error_msg) = req.validate() {
        return Err(AppError::InvalidRequest(error_msg));
    }

    let decision = state.limiter.check(&identity.id, RouteClass::Auth).await;
    if !decision.allowed {
        return Err(AppError::RateLimited(decision));
    }

    let verified = state.credentials.verify(&req.username, &req.password).await;
    let outcome = if verified.is_some() {
        Outcome::Success
    } else {
        Outcome::Failure
    };
    state
        .limiter
        .report(&identity.id, RouteClass::Auth, outcome)
        .await;

    let user = verified.ok_or_else(|| AppError::Unauthorized("Invalid credentials".to_string()))?;
    tracing::info!(user = %user.id, "Login succeeded");

    let mut response = Json(LoginResponse::new(user.id)).into_response();
    decision.write_headers(response.headers_mut());
    Ok(response)
}

/// Handler for POST /auth/register
///
/// Queues the welcome notification and answers without waiting for it.
pub async fn register_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<JobAccepted>)> {
    if let Some(error_msg) = req.validate() {
        return Err(AppError::InvalidRequest(error_msg));
    }

    let job_id = state
        .jobs
        .enqueue(
            NOTIFICATIONS_QUEUE,
            WELCOME_NOTIFICATION,
            serde_json::json!({ "email": req.email, "name": req.name }),
            JobOptions::default(),
        )
        .await?;

    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

// == Jobs ==
/// Handler for POST /api/jobs (admin)
pub async fn submit_job_handler(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<JobSubmission>,
) -> Result<(StatusCode, Json<JobAccepted>)> {
    identity.require_admin()?;

    if let Some(error_msg) = req.validate() {
        return Err(AppError::InvalidRequest(error_msg));
    }
    if !state.registry.contains(&req.job_type) {
        return Err(AppError::InvalidRequest(format!(
            "Unknown job type '{}'",
            req.job_type
        )));
    }

    let options = req.options();
    let job_id = state
        .jobs
        .enqueue(&req.queue_name, &req.job_type, req.data, options)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

/// Handler for GET /api/jobs/:id (admin)
///
/// Records carry payloads such as registration emails, so they are not
/// served to other callers.
pub async fn get_job_handler(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<Job>> {
    identity.require_admin()?;

    let id: JobId = id
        .parse()
        .map_err(|_| AppError::InvalidRequest(format!("Invalid job id '{}'", id)))?;

    state
        .jobs
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))
}

// == Admin ==
/// Handler for POST /admin/cache/invalidate
pub async fn invalidate_cache_handler(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>> {
    identity.require_admin()?;
    if let Some(error_msg) = req.validate() {
        return Err(AppError::InvalidRequest(error_msg));
    }

    let count = state.cache.invalidate(&req.pattern).await?;
    tracing::info!(pattern = %req.pattern, count, admin = %identity.id, "Cache invalidated");

    Ok(Json(InvalidateResponse {
        pattern: req.pattern,
        count,
    }))
}

/// Handler for GET /admin/cache/stats
pub async fn cache_stats_handler(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<StatsResponse>> {
    identity.require_admin()?;
    let stats = state.cache.stats().await?;
    Ok(Json(StatsResponse::from(stats)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::identity::{Role, StaticCredentials};
    use crate::api::state::Collaborators;
    use crate::config::Config;
    use crate::jobs::JobState;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_state() -> AppState {
        let collaborators = Collaborators {
            credentials: Arc::new(StaticCredentials::new().with_account(
                "ada",
                "lovelace",
                Role::User,
            )),
            ..Collaborators::default()
        };
        AppState::from_config(&Config::default(), collaborators).unwrap()
    }

    fn admin() -> Identity {
        Identity::new("root", Role::Admin)
    }

    fn login(password: &str) -> Json<LoginRequest> {
        Json(LoginRequest {
            username: "ada".to_string(),
            password: password.to_string(),
        })
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler().await;
        assert_eq!(response.status, "healthy");
    }

    #[tokio::test]
    async fn test_register_enqueues_welcome_notification() {
        let state = test_state();
        let req = RegisterRequest {
            email: "new@example.com".to_string(),
            name: "New".to_string(),
        };

        let (status, Json(accepted)) = register_handler(State(state.clone()), Json(req))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::ACCEPTED);
        let job = state.jobs.get(accepted.job_id).await.unwrap().unwrap();
        assert_eq!(job.job_type, WELCOME_NOTIFICATION);
        assert_eq!(job.queue_name, NOTIFICATIONS_QUEUE);
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.payload["email"], "new@example.com");
    }

    #[tokio::test]
    async fn test_register_rejects_bad_email() {
        let req = RegisterRequest {
            email: "nope".to_string(),
            name: "New".to_string(),
        };
        let result = register_handler(State(test_state()), Json(req)).await;
        assert!(matches!(result, Err(AppError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_submit_job_requires_admin() {
        let submission: JobSubmission = serde_json::from_value(serde_json::json!({
            "queueName": "maintenance",
            "type": "prune_jobs"
        }))
        .unwrap();

        let user = Identity::new("42", Role::User);
        let result = submit_job_handler(State(test_state()), user, Json(submission)).await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_submit_job_rejects_unknown_type() {
        let submission: JobSubmission = serde_json::from_value(serde_json::json!({
            "queueName": "maintenance",
            "type": "mine_bitcoin"
        }))
        .unwrap();

        let result = submit_job_handler(State(test_state()), admin(), Json(submission)).await;
        assert!(matches!(result, Err(AppError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_submit_and_fetch_job() {
        let state = test_state();
        let submission: JobSubmission = serde_json::from_value(serde_json::json!({
            "queueName": "maintenance",
            "type": "aggregate_analytics",
            "maxAttempts": 5,
            "delayMs": 1000
        }))
        .unwrap();

        let (_, Json(accepted)) =
            submit_job_handler(State(state.clone()), admin(), Json(submission))
                .await
                .unwrap();

        let Json(job) = get_job_handler(State(state), admin(), Path(accepted.job_id.to_string()))
            .await
            .unwrap();
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.scheduled_at, job.created_at + 1000);
    }

    #[tokio::test]
    async fn test_get_job_errors() {
        let state = test_state();

        let result =
            get_job_handler(State(state.clone()), admin(), Path("not-a-uuid".to_string())).await;
        assert!(matches!(result, Err(AppError::InvalidRequest(_))));

        let missing = JobId::new().to_string();
        let result = get_job_handler(State(state), admin(), Path(missing)).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_get_job_requires_admin() {
        let state = test_state();
        let req = RegisterRequest {
            email: "new@example.com".to_string(),
            name: "New".to_string(),
        };
        let (_, Json(accepted)) = register_handler(State(state.clone()), Json(req))
            .await
            .unwrap();

        let user = Identity::new("42", Role::User);
        let result = get_job_handler(State(state), user, Path(accepted.job_id.to_string())).await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_login_success_does_not_consume_budget() {
        let state = test_state();
        let caller = Identity::new("10.0.0.1", Role::Anonymous);

        for _ in 0..10 {
            let response = login_handler(State(state.clone()), caller.clone(), login("lovelace"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_login_failures_exhaust_budget() {
        let state = test_state();
        let caller = Identity::new("10.0.0.2", Role::Anonymous);

        for _ in 0..5 {
            let result = login_handler(State(state.clone()), caller.clone(), login("wrong")).await;
            assert!(matches!(result, Err(AppError::Unauthorized(_))));
        }

        let result = login_handler(State(state), caller, login("lovelace")).await;
        assert!(matches!(result, Err(AppError::RateLimited(_))));
    }

    #[tokio::test]
    async fn test_malformed_login_does_not_consume_budget() {
        let state = test_state();
        let caller = Identity::new("10.0.0.3", Role::Anonymous);
        let empty = || {
            Json(LoginRequest {
                username: String::new(),
                password: String::new(),
            })
        };

        for _ in 0..10 {
            let result = login_handler(State(state.clone()), caller.clone(), empty()).await;
            assert!(matches!(result, Err(AppError::InvalidRequest(_))));
        }

        let response = login_handler(State(state), caller, login("lovelace"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_analytics_not_computed_yet() {
        let result = analytics_handler(State(test_state())).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_analytics_returns_stored_snapshot() {
        let state = test_state();
        let snapshot = AnalyticsSnapshot::compute(&[], chrono::Utc::now());
        state
            .store
            .set(ANALYTICS_KEY, serde_json::to_string(&snapshot).unwrap(), None)
            .await
            .unwrap();

        let Json(served) = analytics_handler(State(state)).await.unwrap();
        assert_eq!(served, snapshot);
    }

    #[tokio::test]
    async fn test_invalidate_cache_requires_admin() {
        let req = InvalidateRequest {
            pattern: "*".to_string(),
        };
        let user = Identity::new("42", Role::User);
        let result = invalidate_cache_handler(State(test_state()), user, Json(req)).await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_invalidate_cache_by_pattern() {
        let state = test_state();
        let ttl = Duration::from_secs(60);
        state.cache.set("weather:mumbai", "{}".to_string(), ttl).await;
        state.cache.set("weather:pune", "{}".to_string(), ttl).await;
        state.cache.set("quote:random", "{}".to_string(), ttl).await;

        let req = InvalidateRequest {
            pattern: "weather:*".to_string(),
        };
        let Json(response) = invalidate_cache_handler(State(state.clone()), admin(), Json(req))
            .await
            .unwrap();

        assert_eq!(response.count, 2);
        assert!(state.cache.get("quote:random").await.is_some());
    }

    #[tokio::test]
    async fn test_cache_stats_handler() {
        let state = test_state();
        state.cache.get("missing").await;

        let Json(stats) = cache_stats_handler(State(state), admin()).await.unwrap();
        assert_eq!(stats.misses, 1);
    }
}
