//! API Middleware
//!
//! Rate limiting per route class and response caching for GET routes.
//! Layered with `axum::middleware::from_fn_with_state`.

use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::cache::CacheKey;
use crate::error::AppError;
use crate::limiter::RouteClass;

use super::identity::Identity;
use super::state::AppState;

/// Lifetime of a cached response body.
pub const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Largest response body the cache will buffer.
const MAX_CACHEABLE_BODY: usize = 1024 * 1024;

pub const CACHE_STATUS_HEADER: &str = "x-cache";

/// Sets `x-cache: HIT|MISS` on a response.
pub fn mark_cache_status(response: &mut Response, from_cache: bool) {
    let value = if from_cache { "HIT" } else { "MISS" };
    response
        .headers_mut()
        .insert(CACHE_STATUS_HEADER, HeaderValue::from_static(value));
}

// == Rate Limiting ==
/// Limits requests of the general route class.
pub async fn limit_general(
    State(state): State<AppState>,
    identity: Identity,
    request: Request,
    next: Next,
) -> Response {
    enforce(&state, &identity, RouteClass::General, request, next).await
}

/// Limits requests that reach third-party providers.
pub async fn limit_upstream(
    State(state): State<AppState>,
    identity: Identity,
    request: Request,
    next: Next,
) -> Response {
    enforce(&state, &identity, RouteClass::Upstream, request, next).await
}

async fn enforce(
    state: &AppState,
    identity: &Identity,
    class: RouteClass,
    request: Request,
    next: Next,
) -> Response {
    let decision = state.limiter.check(&identity.id, class).await;
    if !decision.allowed {
        return AppError::RateLimited(decision).into_response();
    }

    let mut response = next.run(request).await;
    decision.write_headers(response.headers_mut());
    response
}

// == Response Cache ==
/// Serves successful GET responses from the request cache.
///
/// The key is `cache:GET:<path>[?<sorted query>]`, so admin invalidation by
/// pattern reaches these entries. Only 2xx bodies are stored.
pub async fn response_cache(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let uri = request.uri().clone();
    let Some(key) = CacheKey::for_request(request.method(), uri.path(), uri.query()) else {
        return next.run(request).await;
    };

    if let Some(body) = state.cache.get(key.as_str()).await {
        let mut response = (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response();
        mark_cache_status(&mut response, true);
        return response;
    }

    let response = next.run(request).await;
    if !response.status().is_success() {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_CACHEABLE_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Response body could not be buffered");
            return AppError::Internal(e.to_string()).into_response();
        }
    };

    match std::str::from_utf8(&bytes) {
        Ok(text) => {
            state
                .cache
                .set(key.as_str(), text.to_string(), RESPONSE_CACHE_TTL)
                .await
        }
        Err(_) => tracing::debug!(key = %key, "Skipping non-UTF-8 response body"),
    }

    let mut response = Response::from_parts(parts, Body::from(bytes));
    mark_cache_status(&mut response, false);
    response
}
