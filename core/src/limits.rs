use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Immutable rate-limit configuration, selected per request by endpoint
/// classification or risk escalation. Never mutated at runtime; changing a
/// profile means changing configuration and restarting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitProfile {
    pub name: String,
    /// Sliding window length in seconds
    pub window_secs: i64,
    /// Requests admitted per window
    pub max_requests: i64,
    /// How long a key stays blocked once it exhausts the window
    pub block_secs: i64,
}

impl RateLimitProfile {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::seconds(self.block_secs)
    }
}

/// Outcome of one atomic check-and-increment against the counter store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window (0 when denied)
    pub remaining: i64,
    /// When the current window rolls over
    pub reset_at: DateTime<Utc>,
    /// Whether a block is in force for this key
    pub blocked: bool,
    /// Set only on the call that imposed the block, so the caller can emit
    /// a security event exactly once per block
    pub newly_blocked: bool,
    /// End of the block, when one is in force
    pub blocked_until: Option<DateTime<Utc>>,
    /// True when the store was unreachable and the gateway failed open
    pub degraded: bool,
}

impl RateLimitDecision {
    /// An allow produced without consulting the store (fail-open path).
    pub fn fail_open(profile: &RateLimitProfile, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining: profile.max_requests,
            reset_at: now + profile.window(),
            blocked: false,
            newly_blocked: false,
            blocked_until: None,
            degraded: true,
        }
    }

    /// Seconds a denied client should wait before retrying.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let until = self.blocked_until.unwrap_or(self.reset_at);
        (until - now).num_seconds().max(1) as u64
    }
}
