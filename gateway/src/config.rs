use std::collections::HashMap;

use sentra_core::limits::RateLimitProfile;

use crate::classify;

/// Tunables for the behavioral analyzer. All thresholds live here so
/// operators can retune detection without touching the heuristics.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// How long per-identity history is retained, in seconds
    pub retention_secs: i64,
    /// Hard cap on history entries kept per identity
    pub max_history_per_identity: usize,
    /// Sustained-burst threshold: requests in the trailing 60s
    pub burst_60s_threshold: i64,
    /// Spike-burst threshold: requests in the trailing 10s
    pub burst_10s_threshold: i64,
    /// Page-like requests before missing asset traffic becomes suspicious
    pub page_like_threshold: i64,
    /// Identical (method, path) repetitions before flagging
    pub repetition_threshold: i64,
    /// Minimum sample size before the crawl-ratio heuristic applies
    pub crawl_min_sample: i64,
    /// Distinct-endpoint / total-request ratio treated as crawling
    pub crawl_distinct_ratio: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            retention_secs: 30 * 60,
            max_history_per_identity: 256,
            burst_60s_threshold: 20,
            burst_10s_threshold: 5,
            page_like_threshold: 5,
            repetition_threshold: 10,
            crawl_min_sample: 20,
            crawl_distinct_ratio: 0.8,
        }
    }
}

/// Which backing store the limiter uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub profiles: ProfileSet,
    pub analyzer: AnalyzerConfig,
    /// Risk score at or above which the suspicious profile is also applied
    pub risk_threshold: f64,
    /// Base URL of the protected origin
    pub origin_url: String,
    pub store_backend: StoreBackend,
    /// Bound on any single counter-store round trip; past it, fail open
    pub store_timeout_ms: u64,
    /// Counter rows idle longer than this are swept
    pub state_retention_secs: i64,
    pub sweep_interval_secs: u64,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("profile '{0}' is referenced but not defined")]
    UnknownProfile(String),
    #[error("ORIGIN_URL must be set (e.g. http://127.0.0.1:8080)")]
    MissingOrigin,
}

impl GatewayConfig {
    /// Build from the environment. Numeric variables parse defensively to
    /// their defaults; an incomplete profile table is fatal here, never at
    /// request time.
    pub fn from_env() -> Result<Self, ConfigError> {
        let origin_url = std::env::var("ORIGIN_URL").map_err(|_| ConfigError::MissingOrigin)?;
        let store_backend = match std::env::var("GATEWAY_STORE").as_deref() {
            Ok("memory") => StoreBackend::Memory,
            _ => StoreBackend::Postgres,
        };

        let analyzer = AnalyzerConfig {
            burst_60s_threshold: env_i64("GATEWAY_BURST_60S", 20),
            burst_10s_threshold: env_i64("GATEWAY_BURST_10S", 5),
            page_like_threshold: env_i64("GATEWAY_PAGE_LIKE_THRESHOLD", 5),
            repetition_threshold: env_i64("GATEWAY_REPETITION_THRESHOLD", 10),
            ..AnalyzerConfig::default()
        };

        let config = Self {
            profiles: ProfileSet::builtin(),
            analyzer,
            risk_threshold: env_f64("GATEWAY_RISK_THRESHOLD", 0.7),
            origin_url,
            store_backend,
            store_timeout_ms: env_i64("GATEWAY_STORE_TIMEOUT_MS", 500).max(1) as u64,
            state_retention_secs: env_i64("GATEWAY_STATE_RETENTION_SECS", 24 * 3600),
            sweep_interval_secs: env_i64("GATEWAY_SWEEP_INTERVAL_SECS", 300).max(1) as u64,
            port: env_i64("PORT", 3000).clamp(1, 65535) as u16,
        };
        config.validate()?;
        Ok(config)
    }

    /// Every profile name the classifier can emit, plus the escalation
    /// profile, must resolve. Runs once at startup.
    fn validate(&self) -> Result<(), ConfigError> {
        for name in classify::profile_names() {
            self.profiles.required(name)?;
        }
        self.profiles.required(ProfileSet::SUSPICIOUS)?;
        Ok(())
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

/// The immutable profile table. Looked up by name; misses are a startup
/// configuration error, so request-path lookups can't fail.
#[derive(Debug, Clone)]
pub struct ProfileSet {
    profiles: HashMap<String, RateLimitProfile>,
}

impl ProfileSet {
    pub const SUSPICIOUS: &'static str = "suspicious";

    pub fn builtin() -> Self {
        let table = [
            ("auth", 60, 10, 900),
            ("upload", 60, 10, 600),
            ("search", 60, 30, 120),
            ("api", 60, 100, 300),
            ("default", 60, 60, 300),
            (Self::SUSPICIOUS, 60, 10, 3600),
        ];
        let profiles = table
            .into_iter()
            .map(|(name, window_secs, max_requests, block_secs)| {
                (
                    name.to_string(),
                    RateLimitProfile {
                        name: name.to_string(),
                        window_secs,
                        max_requests,
                        block_secs,
                    },
                )
            })
            .collect();
        Self { profiles }
    }

    pub fn required(&self, name: &str) -> Result<&RateLimitProfile, ConfigError> {
        self.profiles
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }

    /// Request-path lookup. Safe after `validate()`: falls back to the
    /// default profile rather than panicking if a name ever goes missing.
    pub fn get_or_default(&self, name: &str) -> &RateLimitProfile {
        self.profiles.get(name).unwrap_or_else(|| {
            self.profiles
                .get("default")
                .unwrap_or_else(|| unreachable!("builtin profile table always contains 'default'"))
        })
    }

    pub fn suspicious(&self) -> &RateLimitProfile {
        self.get_or_default(Self::SUSPICIOUS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_satisfies_classifier_and_escalation() {
        let profiles = ProfileSet::builtin();
        for name in classify::profile_names() {
            assert!(profiles.required(name).is_ok(), "missing profile {name}");
        }
        assert!(profiles.required(ProfileSet::SUSPICIOUS).is_ok());
    }

    #[test]
    fn default_profile_matches_documented_limits() {
        let profiles = ProfileSet::builtin();
        let default = profiles.get_or_default("default");
        assert_eq!(default.window_secs, 60);
        assert_eq!(default.max_requests, 60);
        assert_eq!(default.block_secs, 300);
    }

    #[test]
    fn suspicious_profile_is_tighter_than_default() {
        let profiles = ProfileSet::builtin();
        let suspicious = profiles.suspicious();
        let default = profiles.get_or_default("default");
        assert!(suspicious.max_requests < default.max_requests);
        assert!(suspicious.block_secs > default.block_secs);
    }

    #[test]
    fn unknown_profile_lookup_falls_back_to_default() {
        let profiles = ProfileSet::builtin();
        assert_eq!(profiles.get_or_default("nonexistent").name, "default");
    }
}
