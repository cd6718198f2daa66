//! Rate Limiter Module
//!
//! Fixed-window request gating per identity and route class, with counters
//! kept in the shared store.

mod policy;
mod rate_limiter;

pub use policy::{FailMode, Outcome, RatePolicy, RouteClass};
pub use rate_limiter::{Decision, RateLimiter};
