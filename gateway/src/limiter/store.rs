//! Counter store implementations.
//!
//! The store owns the only shared mutable state in the gateway. All access
//! for a given `(profile, identity)` key goes through one atomic
//! `check_and_increment`; the Postgres implementation serializes on a
//! row-level lock inside a transaction, the in-memory implementation on a
//! single mutex. Both share the same pure window-transition function so the
//! semantics cannot drift apart.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use sentra_core::limits::{RateLimitDecision, RateLimitProfile};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("counter store query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("counter store timed out after {0}ms")]
    Timeout(u64),
}

/// Durable key → window-state mapping for rate counters and blocks.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// The single atomic read-check-increment-write for one key. Two
    /// concurrent calls for the same key must never observe the same
    /// pre-increment count.
    async fn check_and_increment(
        &self,
        profile: &RateLimitProfile,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, StoreError>;

    /// Delete entries idle since before `cutoff`. Best-effort, idempotent.
    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Mutable state for one `(profile, identity)` key.
#[derive(Debug, Clone)]
struct CounterRow {
    count: i64,
    window_start: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
}

impl CounterRow {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
            blocked_until: None,
        }
    }
}

/// The sliding-window + block state machine, applied under whatever
/// serialization the backing store provides.
fn transition(
    mut row: CounterRow,
    profile: &RateLimitProfile,
    now: DateTime<Utc>,
) -> (CounterRow, RateLimitDecision) {
    // An active block denies outright, regardless of counts or windows.
    if let Some(blocked_until) = row.blocked_until
        && blocked_until > now
    {
        let decision = RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_at: row.window_start + profile.window(),
            blocked: true,
            newly_blocked: false,
            blocked_until: Some(blocked_until),
            degraded: false,
        };
        return (row, decision);
    }

    // Expired block or elapsed window: fresh window.
    if row.blocked_until.is_some() || now - row.window_start > profile.window() {
        row = CounterRow::fresh(now);
    }

    if row.count >= profile.max_requests {
        let blocked_until = now + profile.block_duration();
        row.blocked_until = Some(blocked_until);
        let decision = RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_at: row.window_start + profile.window(),
            blocked: true,
            newly_blocked: true,
            blocked_until: Some(blocked_until),
            degraded: false,
        };
        return (row, decision);
    }

    row.count += 1;
    let decision = RateLimitDecision {
        allowed: true,
        remaining: (profile.max_requests - row.count).max(0),
        reset_at: row.window_start + profile.window(),
        blocked: false,
        newly_blocked: false,
        blocked_until: None,
        degraded: false,
    };
    (row, decision)
}

/// Postgres-backed store. Per-key atomicity comes from `SELECT .. FOR
/// UPDATE` inside a transaction; every round trip is bounded by `timeout`,
/// past which the caller fails open.
pub struct PgCounterStore {
    pool: sqlx::PgPool,
    timeout: StdDuration,
}

impl PgCounterStore {
    pub fn new(pool: sqlx::PgPool, timeout_ms: u64) -> Self {
        Self {
            pool,
            timeout: StdDuration::from_millis(timeout_ms),
        }
    }

    async fn check_and_increment_inner(
        &self,
        profile: &RateLimitProfile,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO rate_limit_state (profile, identity, count, window_start, blocked_until) \
             VALUES ($1, $2, 0, $3, NULL) \
             ON CONFLICT (profile, identity) DO NOTHING",
        )
        .bind(&profile.name)
        .bind(identity)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (count, window_start, blocked_until): (i64, DateTime<Utc>, Option<DateTime<Utc>>) =
            sqlx::query_as(
                "SELECT count, window_start, blocked_until FROM rate_limit_state \
                 WHERE profile = $1 AND identity = $2 FOR UPDATE",
            )
            .bind(&profile.name)
            .bind(identity)
            .fetch_one(&mut *tx)
            .await?;

        let (row, decision) = transition(
            CounterRow {
                count,
                window_start,
                blocked_until,
            },
            profile,
            now,
        );

        sqlx::query(
            "UPDATE rate_limit_state \
             SET count = $3, window_start = $4, blocked_until = $5, updated_at = $6 \
             WHERE profile = $1 AND identity = $2",
        )
        .bind(&profile.name)
        .bind(identity)
        .bind(row.count)
        .bind(row.window_start)
        .bind(row.blocked_until)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(decision)
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn check_and_increment(
        &self,
        profile: &RateLimitProfile,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, StoreError> {
        match tokio::time::timeout(
            self.timeout,
            self.check_and_increment_inner(profile, identity, now),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM rate_limit_state \
             WHERE updated_at < $1 AND (blocked_until IS NULL OR blocked_until < $1)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// In-process store: one mutex over the whole map, which trivially
/// serializes per-key access. Used by the tests and by `GATEWAY_STORE=memory`.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<(String, String), CounterRow>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn check_and_increment(
        &self,
        profile: &RateLimitProfile,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, StoreError> {
        let mut entries = self.entries.lock().await;
        let key = (profile.name.clone(), identity.to_string());
        let row = entries
            .get(&key)
            .cloned()
            .unwrap_or_else(|| CounterRow::fresh(now));
        let (row, decision) = transition(row, profile, now);
        entries.insert(key, row);
        Ok(decision)
    }

    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, row| {
            row.window_start >= cutoff || row.blocked_until.is_some_and(|until| until >= cutoff)
        });
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn profile() -> RateLimitProfile {
        RateLimitProfile {
            name: "default".into(),
            window_secs: 60,
            max_requests: 3,
            block_secs: 300,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
    }

    #[test]
    fn transition_counts_up_to_limit_then_blocks() {
        let profile = profile();
        let now = t0();
        let mut row = CounterRow::fresh(now);
        for expected_remaining in [2, 1, 0] {
            let (next, decision) = transition(row, &profile, now);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            row = next;
        }
        let (row, decision) = transition(row, &profile, now);
        assert!(!decision.allowed);
        assert!(decision.newly_blocked);
        assert_eq!(row.blocked_until, Some(now + Duration::seconds(300)));
    }

    #[test]
    fn active_block_denies_even_after_window_would_reset() {
        let profile = profile();
        let now = t0();
        let row = CounterRow {
            count: 3,
            window_start: now - Duration::seconds(200),
            blocked_until: Some(now + Duration::seconds(100)),
        };
        let (row, decision) = transition(row, &profile, now);
        assert!(!decision.allowed);
        assert!(decision.blocked);
        assert!(!decision.newly_blocked);
        assert_eq!(row.count, 3);
    }

    #[test]
    fn expired_block_starts_fresh_window_with_count_one() {
        let profile = profile();
        let now = t0();
        let row = CounterRow {
            count: 3,
            window_start: now - Duration::seconds(400),
            blocked_until: Some(now - Duration::seconds(1)),
        };
        let (row, decision) = transition(row, &profile, now);
        assert!(decision.allowed);
        assert_eq!(row.count, 1);
        assert_eq!(row.window_start, now);
        assert_eq!(row.blocked_until, None);
    }

    #[test]
    fn elapsed_window_resets_before_counting() {
        let profile = profile();
        let start = t0();
        let later = start + Duration::seconds(61);
        let row = CounterRow {
            count: 3,
            window_start: start,
            blocked_until: None,
        };
        let (row, decision) = transition(row, &profile, later);
        assert!(decision.allowed);
        assert_eq!(row.count, 1);
        assert_eq!(decision.reset_at, later + Duration::seconds(60));
    }

    #[tokio::test]
    async fn memory_store_sweep_removes_idle_entries() {
        let store = MemoryCounterStore::new();
        let profile = profile();
        let now = t0();
        store.check_and_increment(&profile, "a", now).await.unwrap();
        store
            .check_and_increment(&profile, "b", now + Duration::hours(3))
            .await
            .unwrap();
        let removed = store.sweep_stale(now + Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 1);
    }
}
