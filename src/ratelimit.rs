//! Per-caller rate limiting.
//!
//! A keyed token bucket per `(user_id, org_id)` pair: the configured
//! requests-per-minute refill with a burst ceiling. Exceeding the bucket
//! yields a 429 whose `Retry-After` is computed from the bucket's earliest
//! permissible time. Idle keys are evicted periodically so the keyed store
//! does not grow without bound.

use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use tokio_util::sync::CancellationToken;

use crate::auth::CallerIdentity;
use crate::error::GatewayError;

type CallerKey = (String, String);

const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

pub struct CallerRateLimiter {
    limiter: RateLimiter<CallerKey, DefaultKeyedStateStore<CallerKey>, DefaultClock>,
    clock: DefaultClock,
}

impl std::fmt::Debug for CallerRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerRateLimiter").finish()
    }
}

impl CallerRateLimiter {
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(nonzero!(1u32));
        let burst = NonZeroU32::new(burst).unwrap_or(nonzero!(1u32));
        let quota = Quota::per_minute(rpm).allow_burst(burst);
        let clock = DefaultClock::default();
        Self {
            limiter: RateLimiter::new(quota, DefaultKeyedStateStore::default(), clock.clone()),
            clock,
        }
    }

    /// Admit or reject the caller. Rejections carry the seconds the client
    /// should wait, surfaced as `Retry-After`.
    pub fn check(&self, identity: &CallerIdentity) -> Result<(), GatewayError> {
        let key = (identity.user_id.clone(), identity.org_id.clone());
        match self.limiter.check_key(&key) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                metrics::counter!("gateway_rate_limited_total").increment(1);
                tracing::debug!(
                    user_id = %identity.user_id,
                    org_id = %identity.org_id,
                    wait_ms = wait.as_millis() as u64,
                    "rate limit exceeded"
                );
                Err(GatewayError::RateLimited {
                    retry_after_secs: wait.as_secs_f64().ceil().max(1.0) as u64,
                })
            }
        }
    }

    /// Drop bucket state for keys that have been idle long enough to be
    /// indistinguishable from new callers.
    pub fn evict_idle(&self) {
        self.limiter.retain_recent();
    }

    pub fn spawn_eviction(self: &Arc<Self>, shutdown: CancellationToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => this.evict_idle(),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthMethod, Role};

    fn identity(user: &str, org: &str) -> CallerIdentity {
        CallerIdentity {
            user_id: user.to_owned(),
            org_id: org.to_owned(),
            email: None,
            display_name: None,
            role: Role::Member,
            is_platform_admin: false,
            auth_method: AuthMethod::StaticKey,
            raw_credential: "k".into(),
        }
    }

    #[test]
    fn burst_admits_then_rejects_with_retry_after() {
        let limiter = CallerRateLimiter::new(60, 10);
        let caller = identity("u1", "o1");
        for _ in 0..10 {
            limiter.check(&caller).expect("burst should be admitted");
        }
        match limiter.check(&caller) {
            Err(GatewayError::RateLimited { retry_after_secs }) => {
                assert!(retry_after_secs >= 1);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn buckets_are_per_caller() {
        let limiter = CallerRateLimiter::new(60, 1);
        limiter.check(&identity("u1", "o1")).unwrap();
        assert!(limiter.check(&identity("u1", "o1")).is_err());
        // Same user in a different org is a different bucket.
        limiter.check(&identity("u1", "o2")).unwrap();
        limiter.check(&identity("u2", "o1")).unwrap();
    }

    #[test]
    fn zero_config_degrades_to_one() {
        let limiter = CallerRateLimiter::new(0, 0);
        let caller = identity("u1", "o1");
        limiter.check(&caller).unwrap();
        assert!(limiter.check(&caller).is_err());
    }
}
