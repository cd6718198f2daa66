//! Background Tasks Module
//!
//! # Tasks
//! - Expiry sweep: reclaims expired entries of the in-memory store

mod cleanup;

pub use cleanup::spawn_cleanup_task;
