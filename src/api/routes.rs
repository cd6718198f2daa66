//! API Routes
//!
//! Configures the Axum router: each route group carries the rate limit
//! layer of its route class.

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    analytics_handler, cache_stats_handler, exchange_handler, get_job_handler, github_handler,
    health_handler, invalidate_cache_handler, login_handler, news_handler, quote_handler,
    register_handler, submit_job_handler, weather_handler,
};
use super::middleware::{limit_general, limit_upstream, response_cache};
use super::state::AppState;

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `GET /health` - Health check (unlimited)
/// - `GET /api/weather/:city`, `/api/news`, `/api/exchange/:base`,
///   `/api/github/:username`, `/api/quote` - Provider data (upstream class)
/// - `GET /api/analytics` - Latest aggregate, response-cached (general class)
/// - `POST /auth/login` - Credential check (authentication class, failures only)
/// - `POST /auth/register` - Queues the welcome notification (general class)
/// - `POST /api/jobs`, `GET /api/jobs/:id` - Job submission and status (general class, admin)
/// - `POST /admin/cache/invalidate`, `GET /admin/cache/stats` - Admin only
///
/// # Middleware
/// - CORS: Allows any origin (configurable for production)
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    // Configure CORS middleware
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let upstream = Router::new()
        .route("/api/weather/:city", get(weather_handler))
        .route("/api/news", get(news_handler))
        .route("/api/exchange/:base", get(exchange_handler))
        .route("/api/github/:username", get(github_handler))
        .route("/api/quote", get(quote_handler))
        .route_layer(from_fn_with_state(state.clone(), limit_upstream));

    // The limit layer is added last so it runs before the cache lookup
    let analytics = Router::new()
        .route("/api/analytics", get(analytics_handler))
        .route_layer(from_fn_with_state(state.clone(), response_cache))
        .route_layer(from_fn_with_state(state.clone(), limit_general));

    let general = Router::new()
        .route("/auth/register", post(register_handler))
        .route("/api/jobs", post(submit_job_handler))
        .route("/api/jobs/:id", get(get_job_handler))
        .route_layer(from_fn_with_state(state.clone(), limit_general));

    let admin = Router::new()
        .route("/admin/cache/invalidate", post(invalidate_cache_handler))
        .route("/admin/cache/stats", get(cache_stats_handler));

    Router::new()
        .route("/health", get(health_handler))
        .route("/auth/login", post(login_handler))
        .merge(upstream)
        .merge(analytics)
        .merge(general)
        .merge(admin)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::state::Collaborators;
    use crate::config::Config;
    use crate::jobs::{AnalyticsSnapshot, ANALYTICS_KEY};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::util::ServiceExt;

    fn create_test_state() -> AppState {
        AppState::from_config(&Config::default(), Collaborators::default()).unwrap()
    }

    fn create_test_app() -> Router {
        create_router(create_test_state())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }

    #[tokio::test]
    async fn test_general_route_carries_rate_limit_headers() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/jobs/00000000-0000-0000-0000-000000000000")
                    .header("x-user-id", "root")
                    .header("x-user-role", "admin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-ratelimit-limit"], "100");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "99");
    }

    #[tokio::test]
    async fn test_register_returns_accepted() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/register")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"email":"a@b.c","name":"A"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_admin_routes_reject_users() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/cache/stats")
                    .header("x-user-id", "7")
                    .header("x-user-role", "user")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_analytics_response_is_cached() {
        let state = create_test_state();
        let snapshot = AnalyticsSnapshot::compute(&[], chrono::Utc::now());
        state
            .store
            .set(ANALYTICS_KEY, serde_json::to_string(&snapshot).unwrap(), None)
            .await
            .unwrap();
        let app = create_router(state.clone());

        let request = || {
            Request::builder()
                .uri("/api/analytics")
                .body(Body::empty())
                .unwrap()
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-cache"], "MISS");
        assert!(state.cache.get("cache:GET:/api/analytics").await.is_some());

        let second = app.oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers()["x-cache"], "HIT");
    }

    #[tokio::test]
    async fn test_missing_analytics_is_not_cached() {
        let state = create_test_state();
        let app = create_router(state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/analytics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(state.cache.get("cache:GET:/api/analytics").await.is_none());
    }
}
