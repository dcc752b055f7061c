use serde::Serialize;

/// Structured error response — designed so automated clients can react
/// deterministically. Every denial carries enough information to back off
/// correctly without parsing prose.
#[derive(Debug, Serialize)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "rate_limited", "internal_error")
    pub error: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Seconds until the client may retry (rate-limit denials only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    /// Whether a block is currently in force for this identity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about how to get back into good standing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error codes used across the gateway
pub mod codes {
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const SUSPICIOUS_ACTIVITY: &str = "suspicious_activity_blocked";
    pub const BAD_GATEWAY: &str = "bad_gateway";
    pub const INTERNAL_ERROR: &str = "internal_error";
}
