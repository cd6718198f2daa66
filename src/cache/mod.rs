//! Cache Module
//!
//! Response caching for read-only operations on top of the shared store.

mod key;
mod request_cache;

pub use key::{in_cache_namespace, CacheKey, CACHE_PREFIX};
pub use request_cache::{Cached, RequestCache};
