//! Fixed-window rate limiter over the shared store.
//!
//! One counter per `(route class, identity)` under
//! `ratelimit:<class>:<identity>`. The counter's expiry is set when the first
//! request of a window creates it, so the window ends exactly one window size
//! after it started and the next request opens a fresh one.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue};
use serde::Serialize;
use tracing::{debug, warn};

use super::policy::{FailMode, Outcome, RatePolicy, RouteClass};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{Counter, StateStore};

// == Decision ==
/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// When the current window ends (Unix ms)
    pub reset_at_ms: u64,
    /// When the decision was taken (Unix ms)
    pub now_ms: u64,
}

impl Decision {
    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.reset_at_ms.saturating_sub(self.now_ms).div_ceil(1000)
    }

    /// Writes `x-ratelimit-limit`, `x-ratelimit-remaining` and
    /// `x-ratelimit-reset` (Unix seconds).
    pub fn write_headers(&self, headers: &mut HeaderMap) {
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from(self.reset_at_ms.div_ceil(1000)),
        );
    }
}

// == Rate Limiter ==
/// Gates operations per identity and route class.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    fail_mode: FailMode,
    policies: HashMap<RouteClass, RatePolicy>,
}

impl RateLimiter {
    /// Creates a limiter with the default policy for every class.
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, fail_mode: FailMode) -> Self {
        let policies = [RouteClass::General, RouteClass::Auth, RouteClass::Upstream]
            .into_iter()
            .map(|class| (class, RatePolicy::for_class(class)))
            .collect();
        Self {
            store,
            clock,
            fail_mode,
            policies,
        }
    }

    /// Replaces the policy of `class`.
    pub fn with_policy(mut self, class: RouteClass, policy: RatePolicy) -> Self {
        self.policies.insert(class, policy);
        self
    }

    pub fn policy(&self, class: RouteClass) -> RatePolicy {
        self.policies
            .get(&class)
            .copied()
            .unwrap_or_else(|| RatePolicy::for_class(class))
    }

    pub fn fail_mode(&self) -> FailMode {
        self.fail_mode
    }

    fn key(class: RouteClass, identity: &str) -> String {
        format!("ratelimit:{}:{}", class, identity)
    }

    /// Decides whether `identity` may perform an operation of `class` now.
    ///
    /// Every admitted check takes one unit of the budget. For classes that
    /// count only failures the unit is a reservation: the caller settles it
    /// through [`report`](Self::report), and a rejected check gives its unit
    /// back at once. Concurrent attempts therefore cannot all slip under the
    /// limit before any of them has failed.
    pub async fn check(&self, identity: &str, class: RouteClass) -> Decision {
        let policy = self.policy(class);
        let key = Self::key(class, identity);
        let now = self.clock.now_ms();

        let counter = match self.store.increment(&key, policy.window).await {
            Ok(counter) => counter,
            Err(e) => return self.unavailable(&policy, identity, class, now, &e),
        };
        let decision = counted_decision(&policy, counter, now);

        if !decision.allowed {
            debug!(identity = %identity, route_class = %class, reset_at_ms = decision.reset_at_ms, "Rate limit exceeded");
            if policy.count_only_failures {
                self.give_back(&key, identity, class).await;
            }
        }
        decision
    }

    /// Settles the reservation of an attempt that `check` admitted.
    ///
    /// A failure keeps the unit; a success returns it. Reports for classes
    /// that count every request are no-ops.
    pub async fn report(&self, identity: &str, class: RouteClass, outcome: Outcome) {
        let policy = self.policy(class);
        if !policy.count_only_failures {
            return;
        }

        match outcome {
            Outcome::Failure => {
                debug!(identity = %identity, route_class = %class, "Failed attempt counted");
            }
            Outcome::Success => {
                let key = Self::key(class, identity);
                self.give_back(&key, identity, class).await;
            }
        }
    }

    async fn give_back(&self, key: &str, identity: &str, class: RouteClass) {
        if let Err(e) = self.store.release(key).await {
            warn!(identity = %identity, route_class = %class, error = %e, "Reserved attempt not returned, store unavailable");
        }
    }

    fn unavailable(
        &self,
        policy: &RatePolicy,
        identity: &str,
        class: RouteClass,
        now: u64,
        error: &StoreError,
    ) -> Decision {
        let allowed = self.fail_mode == FailMode::Open;
        warn!(
            identity = %identity,
            route_class = %class,
            error = %error,
            fail_mode = ?self.fail_mode,
            allowed,
            "Rate limit store unavailable"
        );
        Decision {
            allowed,
            limit: policy.limit,
            remaining: if allowed { policy.limit } else { 0 },
            reset_at_ms: now.saturating_add(policy.window_ms()),
            now_ms: now,
        }
    }
}

fn counted_decision(policy: &RatePolicy, counter: Counter, now: u64) -> Decision {
    Decision {
        allowed: counter.count <= policy.limit,
        limit: policy.limit,
        remaining: policy.limit.saturating_sub(counter.count),
        reset_at_ms: counter.expires_at_ms,
        now_ms: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RequestCache;
    use crate::clock::ManualClock;
    use crate::store::testing::UnreachableStore;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn limiter_with(policy: RatePolicy, class: RouteClass) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryStore::new(1_000, clock.clone()));
        let limiter = RateLimiter::new(store, clock.clone(), FailMode::Open).with_policy(class, policy);
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_eleventh_call_in_window_is_rejected() {
        let (limiter, _) = limiter_with(RatePolicy::upstream(), RouteClass::Upstream);

        for i in 0..10 {
            let decision = limiter.check("1.2.3.4", RouteClass::Upstream).await;
            assert!(decision.allowed, "call {} should pass", i + 1);
            assert_eq!(decision.remaining, 9 - i);
        }

        let rejected = limiter.check("1.2.3.4", RouteClass::Upstream).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.reset_at_ms, 1_060_000);
    }

    #[tokio::test]
    async fn test_new_window_starts_fresh() {
        let (limiter, clock) = limiter_with(RatePolicy::upstream(), RouteClass::Upstream);
        for _ in 0..11 {
            limiter.check("user-1", RouteClass::Upstream).await;
        }

        clock.advance(Duration::from_millis(61_000));
        let decision = limiter.check("user-1", RouteClass::Upstream).await;

        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert_eq!(decision.reset_at_ms, 1_061_000 + 60_000);
    }

    #[tokio::test]
    async fn test_window_does_not_slide() {
        let (limiter, clock) = limiter_with(RatePolicy::upstream(), RouteClass::Upstream);
        let first = limiter.check("user-1", RouteClass::Upstream).await;

        clock.advance(Duration::from_millis(59_999));
        let later = limiter.check("user-1", RouteClass::Upstream).await;

        assert_eq!(first.reset_at_ms, later.reset_at_ms);
        assert_eq!(later.remaining, 8);
    }

    #[tokio::test]
    async fn test_identities_and_classes_are_independent() {
        let (limiter, _) = limiter_with(RatePolicy::new(Duration::from_secs(60), 1), RouteClass::General);

        assert!(limiter.check("a", RouteClass::General).await.allowed);
        assert!(!limiter.check("a", RouteClass::General).await.allowed);
        assert!(limiter.check("b", RouteClass::General).await.allowed);
        assert!(limiter.check("a", RouteClass::Upstream).await.allowed);
    }

    #[tokio::test]
    async fn test_auth_counts_only_failures() {
        let (limiter, _) = limiter_with(RatePolicy::auth(), RouteClass::Auth);

        for _ in 0..20 {
            assert!(limiter.check("ip", RouteClass::Auth).await.allowed);
            limiter.report("ip", RouteClass::Auth, Outcome::Success).await;
        }

        for _ in 0..5 {
            assert!(limiter.check("ip", RouteClass::Auth).await.allowed);
            limiter.report("ip", RouteClass::Auth, Outcome::Failure).await;
        }

        let sixth = limiter.check("ip", RouteClass::Auth).await;
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
    }

    #[tokio::test]
    async fn test_success_after_failures_does_not_count() {
        let (limiter, _) = limiter_with(RatePolicy::auth(), RouteClass::Auth);
        for _ in 0..4 {
            assert!(limiter.check("ip", RouteClass::Auth).await.allowed);
            limiter.report("ip", RouteClass::Auth, Outcome::Failure).await;
        }
        assert!(limiter.check("ip", RouteClass::Auth).await.allowed);
        limiter.report("ip", RouteClass::Auth, Outcome::Success).await;

        // Four failures on record: this attempt is the last one allowed
        let decision = limiter.check("ip", RouteClass::Auth).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_concurrent_auth_attempts_share_the_budget() {
        let (limiter, _) = limiter_with(RatePolicy::auth(), RouteClass::Auth);

        // Twenty logins in flight at once, none reported yet
        let attempts: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check("attacker", RouteClass::Auth).await })
            })
            .collect();

        let mut admitted = 0;
        for attempt in attempts {
            if attempt.await.unwrap().allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);

        for _ in 0..admitted {
            limiter.report("attacker", RouteClass::Auth, Outcome::Failure).await;
        }
        assert!(!limiter.check("attacker", RouteClass::Auth).await.allowed);
    }

    #[tokio::test]
    async fn test_rejected_auth_check_returns_its_reservation() {
        let (limiter, _) = limiter_with(
            RatePolicy::new(Duration::from_secs(60), 1).counting_only_failures(),
            RouteClass::Auth,
        );

        assert!(limiter.check("ip", RouteClass::Auth).await.allowed);
        for _ in 0..10 {
            assert!(!limiter.check("ip", RouteClass::Auth).await.allowed);
        }
        // Only the in-flight attempt holds the budget; its success frees it
        limiter.report("ip", RouteClass::Auth, Outcome::Success).await;
        assert!(limiter.check("ip", RouteClass::Auth).await.allowed);
    }

    #[tokio::test]
    async fn test_auth_budget_survives_cache_writes_and_invalidation() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryStore::new(100, clock.clone()));
        let limiter = RateLimiter::new(store.clone(), clock, FailMode::Open);
        let cache = RequestCache::new(store);

        for _ in 0..5 {
            assert!(limiter.check("ip", RouteClass::Auth).await.allowed);
            limiter.report("ip", RouteClass::Auth, Outcome::Failure).await;
        }

        for i in 0..100 {
            let key = format!("GET:/api/analytics?page={}", i);
            cache.set(&key, "{}".to_string(), Duration::from_secs(60)).await;
        }
        cache.invalidate("*").await.unwrap();

        let decision = limiter.check("ip", RouteClass::Auth).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_report_is_noop_for_counting_classes() {
        let (limiter, _) = limiter_with(RatePolicy::new(Duration::from_secs(60), 2), RouteClass::General);
        limiter.report("ip", RouteClass::General, Outcome::Failure).await;

        assert_eq!(limiter.check("ip", RouteClass::General).await.remaining, 1);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_open() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::new(Arc::new(UnreachableStore), clock, FailMode::Open);

        let decision = limiter.check("ip", RouteClass::General).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 100);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_closed() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::new(Arc::new(UnreachableStore), clock, FailMode::Closed);

        let decision = limiter.check("ip", RouteClass::Auth).await;
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs(), 900);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let decision = Decision {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset_at_ms: 10_001,
            now_ms: 0,
        };
        assert_eq!(decision.retry_after_secs(), 11);

        let mut headers = HeaderMap::new();
        decision.write_headers(&mut headers);
        assert_eq!(headers["x-ratelimit-limit"], "10");
        assert_eq!(headers["x-ratelimit-reset"], "11");
    }
}
