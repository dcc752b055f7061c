//! Behavioral analysis: a rolling per-identity history and six heuristics
//! that fold into one [0,1] risk score.
//!
//! The history is process-local and best-effort — it accelerates detection
//! but is never authoritative; the counter store remains the source of truth
//! for enforcement. Losing it on restart costs at worst a missed detection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::RwLock;

use sentra_core::findings::{FindingKind, Severity, SuspicionFinding, risk_score};

use crate::config::AnalyzerConfig;
use crate::signal::RequestSignal;

const AUTOMATION_SIGNATURES: &[&str] = &[
    "curl",
    "wget",
    "python-requests",
    "python-urllib",
    "python-httpx",
    "aiohttp",
    "go-http-client",
    "okhttp",
    "java/",
    "libwww-perl",
    "ruby",
    "scrapy",
    "httpie",
    "node-fetch",
    "axios",
    "guzzle",
    "apache-httpclient",
    "headlesschrome",
    "phantomjs",
    "selenium",
    "puppeteer",
    "playwright",
    "postmanruntime",
    "bot",
    "spider",
    "crawler",
];

const ASSET_EXTENSIONS: &[&str] = &[
    "css", "js", "mjs", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "woff", "woff2", "ttf",
    "otf", "map",
];

const PAGE_EXTENSIONS: &[&str] = &["html", "htm", "xhtml", "php"];

#[derive(Debug, Clone)]
struct HistoryEntry {
    at: DateTime<Utc>,
    method: String,
    path: String,
}

/// Result of analyzing one request.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub findings: Vec<SuspicionFinding>,
    pub risk_score: f64,
}

/// Maintains the rolling history and runs the heuristics. Cheap to clone;
/// all clones share one history map.
#[derive(Clone)]
pub struct BehaviorAnalyzer {
    config: Arc<AnalyzerConfig>,
    history: Arc<RwLock<HashMap<String, VecDeque<HistoryEntry>>>>,
}

impl BehaviorAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config: Arc::new(config),
            history: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record the request into the identity's history, prune anything past
    /// retention, and evaluate all heuristics against the updated window.
    /// Deterministic: identical history plus identical `received_at` yields
    /// identical findings.
    pub async fn analyze(&self, signal: &RequestSignal) -> Analysis {
        let now = signal.received_at;
        let window: Vec<HistoryEntry> = {
            let mut lock = self.history.write().await;
            let entries = lock.entry(signal.identity.clone()).or_default();
            entries.push_back(HistoryEntry {
                at: now,
                method: signal.method.clone(),
                path: signal.path.clone(),
            });
            let cutoff = now - Duration::seconds(self.config.retention_secs);
            while let Some(front) = entries.front() {
                if front.at < cutoff || entries.len() > self.config.max_history_per_identity {
                    entries.pop_front();
                } else {
                    break;
                }
            }
            entries.iter().cloned().collect()
        };

        let findings = evaluate(&window, signal, &self.config, now);
        Analysis {
            risk_score: risk_score(&findings),
            findings,
        }
    }

    /// Drop identities whose newest entry is past retention. Best-effort,
    /// idempotent; called from the periodic sweeper.
    pub async fn prune_stale(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(self.config.retention_secs);
        let mut lock = self.history.write().await;
        let before = lock.len();
        lock.retain(|_, entries| entries.back().is_some_and(|entry| entry.at >= cutoff));
        before - lock.len()
    }
}

fn evaluate(
    window: &[HistoryEntry],
    signal: &RequestSignal,
    config: &AnalyzerConfig,
    now: DateTime<Utc>,
) -> Vec<SuspicionFinding> {
    let mut findings = Vec::new();

    burst_findings(window, config, now, &mut findings);
    asset_correlation_finding(window, signal, config, &mut findings);
    navigation_findings(window, signal, config, &mut findings);
    repetition_finding(window, config, &mut findings);
    automation_signature_finding(signal, &mut findings);
    fingerprint_finding(signal, &mut findings);

    findings
}

/// Two horizons: the 60s count catches sustained hammering, the 10s count
/// catches short spikes that would hide inside a quiet minute.
fn burst_findings(
    window: &[HistoryEntry],
    config: &AnalyzerConfig,
    now: DateTime<Utc>,
    findings: &mut Vec<SuspicionFinding>,
) {
    let count_60s = count_since(window, now - Duration::seconds(60));
    let count_10s = count_since(window, now - Duration::seconds(10));

    if count_60s > config.burst_60s_threshold {
        findings.push(SuspicionFinding::new(
            FindingKind::BurstTraffic,
            Severity::High,
            0.85,
            scale_over(count_60s, config.burst_60s_threshold),
            json!({ "horizon_secs": 60, "count": count_60s, "threshold": config.burst_60s_threshold }),
        ));
    }
    if count_10s > config.burst_10s_threshold {
        findings.push(SuspicionFinding::new(
            FindingKind::BurstTraffic,
            Severity::Medium,
            0.75,
            scale_over(count_10s, config.burst_10s_threshold),
            json!({ "horizon_secs": 10, "count": count_10s, "threshold": config.burst_10s_threshold }),
        ));
    }
}

/// Real browsers fetch stylesheets, scripts and images alongside pages. A
/// window full of page-like requests with zero asset traffic (observed or
/// client-reported) is a strong script tell.
fn asset_correlation_finding(
    window: &[HistoryEntry],
    signal: &RequestSignal,
    config: &AnalyzerConfig,
    findings: &mut Vec<SuspicionFinding>,
) {
    let page_like = window
        .iter()
        .filter(|entry| is_page_like(&entry.path))
        .count() as i64;
    let assets = window.iter().filter(|entry| is_asset(&entry.path)).count() as i64;

    if page_like > config.page_like_threshold && assets == 0 && !signal.asset_requests {
        findings.push(SuspicionFinding::new(
            FindingKind::MissingAssetCorrelation,
            Severity::High,
            0.7,
            scale_over(page_like, config.page_like_threshold),
            json!({ "page_like": page_like, "assets": assets }),
        ));
    }
}

fn navigation_findings(
    window: &[HistoryEntry],
    signal: &RequestSignal,
    config: &AnalyzerConfig,
    findings: &mut Vec<SuspicionFinding>,
) {
    if is_api_path(&signal.path) && signal.referer.is_none() && !signal.mouse_movements {
        findings.push(SuspicionFinding::new(
            FindingKind::NonHumanNavigation,
            Severity::Medium,
            0.6,
            0.8,
            json!({
                "path": signal.path,
                "referer": false,
                "mouse_movements": false,
                "keyboard_activity": signal.keyboard_activity,
                "click_tokens": signal.click_pattern.len(),
                "navigation_tokens": signal.navigation_pattern.len(),
                "form_fill_ms": signal.form_fill_ms,
            }),
        ));
    }

    // Broad, shallow coverage over a large sample reads as crawling.
    let total = window.len() as i64;
    if total >= config.crawl_min_sample {
        let distinct = window
            .iter()
            .map(|entry| entry.path.as_str())
            .collect::<HashSet<_>>()
            .len() as i64;
        let ratio = distinct as f64 / total as f64;
        if ratio >= config.crawl_distinct_ratio {
            findings.push(SuspicionFinding::new(
                FindingKind::NonHumanNavigation,
                Severity::Medium,
                0.65,
                ratio,
                json!({ "distinct_endpoints": distinct, "total": total, "ratio": ratio }),
            ));
        }
    }
}

fn repetition_finding(
    window: &[HistoryEntry],
    config: &AnalyzerConfig,
    findings: &mut Vec<SuspicionFinding>,
) {
    let mut groups: HashMap<(&str, &str), i64> = HashMap::new();
    for entry in window {
        *groups
            .entry((entry.method.as_str(), entry.path.as_str()))
            .or_default() += 1;
    }
    let Some(((method, path), count)) = groups
        .into_iter()
        .max_by(|left, right| left.1.cmp(&right.1).then(left.0.cmp(&right.0)))
    else {
        return;
    };

    if count > config.repetition_threshold {
        let dominance = count as f64 / window.len().max(1) as f64;
        let severity = if dominance > 0.8 {
            Severity::High
        } else {
            Severity::Medium
        };
        findings.push(SuspicionFinding::new(
            FindingKind::RepeatedIdenticalRequests,
            severity,
            0.7,
            dominance,
            json!({ "method": method, "path": path, "count": count, "dominance": dominance }),
        ));
    }
}

/// Independent of history: a user agent naming an HTTP library, headless
/// browser or automation framework is near-certain automation.
fn automation_signature_finding(signal: &RequestSignal, findings: &mut Vec<SuspicionFinding>) {
    let user_agent = signal.user_agent.to_lowercase();
    if user_agent.is_empty() {
        return;
    }
    if let Some(signature) = AUTOMATION_SIGNATURES
        .iter()
        .find(|signature| user_agent.contains(*signature))
    {
        findings.push(SuspicionFinding::new(
            FindingKind::KnownAutomationSignature,
            Severity::High,
            0.98,
            1.0,
            json!({ "user_agent": signal.user_agent, "signature": signature }),
        ));
    }
}

/// Weak alone, but it compounds with the other signals.
fn fingerprint_finding(signal: &RequestSignal, findings: &mut Vec<SuspicionFinding>) {
    if signal.fingerprint_absent() {
        findings.push(SuspicionFinding::new(
            FindingKind::MissingBrowserFingerprint,
            Severity::Medium,
            0.5,
            0.7,
            json!({ "screen_resolution": false, "timezone": false, "accept_language": false }),
        ));
    }
}

fn count_since(window: &[HistoryEntry], cutoff: DateTime<Utc>) -> i64 {
    window.iter().filter(|entry| entry.at >= cutoff).count() as i64
}

/// 0.5 at the threshold, 1.0 at twice the threshold.
fn scale_over(count: i64, threshold: i64) -> f64 {
    (count as f64 / (threshold.max(1) as f64 * 2.0)).min(1.0)
}

fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    (!ext.is_empty()).then_some(ext)
}

fn is_asset(path: &str) -> bool {
    extension(path).is_some_and(|ext| {
        let ext = ext.to_lowercase();
        ASSET_EXTENSIONS.contains(&ext.as_str())
    })
}

fn is_page_like(path: &str) -> bool {
    match extension(path) {
        None => true,
        Some(ext) => {
            let ext = ext.to_lowercase();
            PAGE_EXTENSIONS.contains(&ext.as_str())
        }
    }
}

fn is_api_path(path: &str) -> bool {
    path.starts_with("/api") || path.starts_with("/v1/") || path.contains("/internal/")
}
