//! Cache key construction.
//!
//! Keys are derived only from the operation identity, so two requests that
//! differ only in query parameter order share one entry. Every cache key
//! starts with `cache:`, which keeps cached results apart from rate limit
//! counters and other records in the same store.

use std::borrow::Cow;
use std::fmt;

use axum::http::Method;

/// Prefix of every key the request cache owns.
pub const CACHE_PREFIX: &str = "cache:";

/// Places a key or glob inside the cache namespace.
///
/// Input that already carries the prefix is returned as is, so `weather:*`
/// and `cache:weather:*` name the same entries and `*` names all of them.
pub fn in_cache_namespace(key: &str) -> Cow<'_, str> {
    if key.starts_with(CACHE_PREFIX) {
        Cow::Borrowed(key)
    } else {
        Cow::Owned(format!("{}{}", CACHE_PREFIX, key))
    }
}

/// A normalized cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// `cache:<METHOD>:<path>[?<sorted query>]`.
    ///
    /// Returns `None` for methods that may have side effects; their results
    /// must never be cached.
    pub fn for_request(method: &Method, path: &str, query: Option<&str>) -> Option<Self> {
        if method != Method::GET && method != Method::HEAD {
            return None;
        }

        let mut key = format!("{}{}:{}", CACHE_PREFIX, method.as_str(), path);
        if let Some(sorted) = query.map(sorted_query).filter(|q| !q.is_empty()) {
            key.push('?');
            key.push_str(&sorted);
        }
        Some(Self(key))
    }

    /// `cache:<namespace>:<part>:<part>...`, e.g. `cache:news:us:technology`.
    pub fn scoped(namespace: &str, parts: &[&str]) -> Self {
        let mut key = format!("{}{}", CACHE_PREFIX, namespace);
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn sorted_query(query: &str) -> String {
    let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    pairs.sort_unstable();
    pairs.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_order_does_not_matter() {
        let a = CacheKey::for_request(&Method::GET, "/api/news", Some("country=us&category=tech"));
        let b = CacheKey::for_request(&Method::GET, "/api/news", Some("category=tech&country=us"));

        assert_eq!(a, b);
        assert_eq!(
            a.unwrap().as_str(),
            "cache:GET:/api/news?category=tech&country=us"
        );
    }

    #[test]
    fn test_no_query_has_no_separator() {
        let key = CacheKey::for_request(&Method::GET, "/api/analytics", None).unwrap();
        assert_eq!(key.as_str(), "cache:GET:/api/analytics");

        let empty = CacheKey::for_request(&Method::GET, "/api/analytics", Some("")).unwrap();
        assert_eq!(empty, key);
    }

    #[test]
    fn test_writes_are_not_cacheable() {
        assert!(CacheKey::for_request(&Method::POST, "/auth/register", None).is_none());
        assert!(CacheKey::for_request(&Method::DELETE, "/api/jobs/1", None).is_none());
        assert!(CacheKey::for_request(&Method::HEAD, "/api/quote", None).is_some());
    }

    #[test]
    fn test_scoped_key() {
        assert_eq!(
            CacheKey::scoped("weather", &["mumbai"]).as_str(),
            "cache:weather:mumbai"
        );
        assert_eq!(
            CacheKey::scoped("news", &["us", "technology"]).to_string(),
            "cache:news:us:technology"
        );
    }

    #[test]
    fn test_namespace_is_applied_once() {
        assert_eq!(in_cache_namespace("*"), "cache:*");
        assert_eq!(in_cache_namespace("weather:*"), "cache:weather:*");
        assert_eq!(in_cache_namespace("cache:GET:/api/analytics*"), "cache:GET:/api/analytics*");
        assert_eq!(in_cache_namespace("ratelimit:*"), "cache:ratelimit:*");
    }
}
