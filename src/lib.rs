//! gatekeep - a front door for slow or rate-limited upstream work
//!
//! Caches third-party responses, rate limits callers per route class, and
//! moves slow work onto durable, retrying background job queues driven by
//! workers and a cron scheduler.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod limiter;
pub mod models;
pub mod store;
pub mod tasks;

pub use api::{create_router, AppState, Collaborators};
pub use config::Config;
pub use tasks::spawn_cleanup_task;
