//! API Module
//!
//! HTTP surface over the cache, rate limiter, gateway and job queue.
//!
//! # Endpoints
//! - `GET /health` - Health check
//! - `GET /api/{weather,news,exchange,github,quote}` - Cached provider data
//! - `GET /api/analytics` - Latest analytics aggregate
//! - `POST /auth/login`, `POST /auth/register` - Authentication
//! - `POST /api/jobs`, `GET /api/jobs/:id` - Background jobs
//! - `POST /admin/cache/invalidate`, `GET /admin/cache/stats` - Cache administration

pub mod handlers;
pub mod identity;
pub mod middleware;
pub mod routes;
pub mod state;

pub use handlers::*;
pub use identity::{CredentialVerifier, Identity, Role, StaticCredentials};
pub use routes::create_router;
pub use state::{AppState, Collaborators, QUEUES};
