use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::findings::SuspicionFinding;

/// Kinds of durable security events the gateway appends to the audit sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    RateLimitExceeded,
    SuspiciousActivityBlocked,
    StoreDegraded,
}

impl SecurityEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityEventType::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventType::SuspiciousActivityBlocked => "suspicious_activity_blocked",
            SecurityEventType::StoreDegraded => "store_degraded",
        }
    }
}

/// Append-only record written whenever a block is imposed or risk crosses
/// the high-severity threshold. Never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub severity: String,
    pub identity: String,
    pub client_addr: String,
    pub user_agent: String,
    /// Profile, counts, findings — whatever the emitting component knows
    pub detail: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// Durable trace of one analyzed request: what the analyzer concluded and
/// what the gateway did about it. Written for every decision whose risk
/// score crossed the escalation threshold, allowed or not, so thresholds
/// can be tuned offline against real traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehavioralLogEntry {
    pub identity: String,
    pub endpoint: String,
    pub method: String,
    pub findings: Vec<SuspicionFinding>,
    pub risk_score: f64,
    pub allowed: bool,
    pub occurred_at: DateTime<Utc>,
}
