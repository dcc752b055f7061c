//! Sliding-window rate limiting over the counter store.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use sentra_core::limits::{RateLimitDecision, RateLimitProfile};

pub mod store;

pub use store::{CounterStore, MemoryCounterStore, PgCounterStore, StoreError};

/// Enforces one profile per call against the shared counter store. Fails
/// open: if the store is unreachable the request is admitted and the
/// degradation logged — availability of the origin beats perfect
/// enforcement during an outage.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub async fn check(
        &self,
        profile: &RateLimitProfile,
        identity: &str,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        match self.store.check_and_increment(profile, identity, now).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    profile = %profile.name,
                    identity = identity,
                    "counter store unavailable; failing open"
                );
                RateLimitDecision::fail_open(profile, now)
            }
        }
    }

    pub async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.store.sweep_stale(cutoff).await
    }
}
