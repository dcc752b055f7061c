//! The admission-control orchestrator.
//!
//! Per request: extract the signal, run the behavioral analyzer, pick the
//! endpoint's profile, and consult the rate limiter. Risk at or above the
//! escalation threshold additionally runs the `suspicious` profile — the
//! request must pass both. Either way the decision metadata is attached to
//! the response so well-behaved clients can back off correctly.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::Json;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde_json::json;
use tower::{Layer, Service, ServiceExt};
use uuid::Uuid;

use sentra_core::error::{ApiError, codes};
use sentra_core::events::{BehavioralLogEntry, SecurityEvent, SecurityEventType};
use sentra_core::limits::{RateLimitDecision, RateLimitProfile};

use crate::analyzer::{Analysis, BehaviorAnalyzer};
use crate::classify;
use crate::config::GatewayConfig;
use crate::events::EventSink;
use crate::limiter::RateLimiter;
use crate::signal::{self, RequestSignal};

#[derive(Clone)]
pub struct GatewayLayer {
    config: Arc<GatewayConfig>,
    analyzer: BehaviorAnalyzer,
    limiter: RateLimiter,
    sink: EventSink,
}

impl GatewayLayer {
    pub fn new(
        config: Arc<GatewayConfig>,
        analyzer: BehaviorAnalyzer,
        limiter: RateLimiter,
        sink: EventSink,
    ) -> Self {
        Self {
            config,
            analyzer,
            limiter,
            sink,
        }
    }
}

impl<S> Layer<S> for GatewayLayer {
    type Service = GatewayService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GatewayService {
            inner,
            config: self.config.clone(),
            analyzer: self.analyzer.clone(),
            limiter: self.limiter.clone(),
            sink: self.sink.clone(),
        }
    }
}

#[derive(Clone)]
pub struct GatewayService<S> {
    inner: S,
    config: Arc<GatewayConfig>,
    analyzer: BehaviorAnalyzer,
    limiter: RateLimiter,
    sink: EventSink,
}

impl<S> Service<Request> for GatewayService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);
        let config = self.config.clone();
        let analyzer = self.analyzer.clone();
        let limiter = self.limiter.clone();
        let sink = self.sink.clone();

        Box::pin(async move {
            // Liveness probes bypass admission control entirely.
            if req.uri().path() == "/health" {
                return Ok(ready.oneshot(req).await.into_response());
            }

            let now = Utc::now();
            let signal = signal::extract(&req, now);
            tracing::debug!(
                identity = %signal.identity,
                user_id = ?signal.user_id,
                session_id = ?signal.session_id,
                method = %signal.method,
                path = %signal.path,
                payload_bytes = signal.declared_payload_size,
                "admission check"
            );
            let analysis = analyzer.analyze(&signal).await;

            let profile = config.profiles.get_or_default(classify::classify(&signal.path));
            let normal = limiter.check(profile, &signal.identity, now).await;
            if normal.degraded {
                sink.record_security_event(degradation_event(&signal, profile, now));
            }

            let escalated = analysis.risk_score >= config.risk_threshold;
            let suspicious = if escalated {
                let suspicious_profile = config.profiles.suspicious();
                Some((
                    suspicious_profile,
                    limiter.check(suspicious_profile, &signal.identity, now).await,
                ))
            } else {
                None
            };
            if let Some((suspicious_profile, decision)) = &suspicious
                && decision.degraded
            {
                sink.record_security_event(degradation_event(&signal, *suspicious_profile, now));
            }

            // Denied if EITHER check denies; the suspicious check's tighter
            // metadata wins when both do.
            let denial = match &suspicious {
                Some((suspicious_profile, decision)) if !decision.allowed => {
                    Some((*suspicious_profile, decision, true))
                }
                _ if !normal.allowed => Some((profile, &normal, false)),
                _ => None,
            };

            if normal.newly_blocked {
                sink.record_security_event(block_event(&signal, profile, &normal, &analysis, now));
            }
            if let Some((suspicious_profile, decision)) = &suspicious
                && decision.newly_blocked
            {
                sink.record_security_event(block_event(
                    &signal,
                    *suspicious_profile,
                    decision,
                    &analysis,
                    now,
                ));
            }

            let allowed = denial.is_none();
            if escalated {
                sink.record_behavioral_entry(BehavioralLogEntry {
                    identity: signal.identity.clone(),
                    endpoint: signal.path.clone(),
                    method: signal.method.clone(),
                    findings: analysis.findings.clone(),
                    risk_score: analysis.risk_score,
                    allowed,
                    occurred_at: now,
                });
            }

            if let Some((denying_profile, decision, due_to_suspicion)) = denial {
                if due_to_suspicion {
                    sink.record_security_event(suspicion_event(&signal, &analysis, decision, now));
                }
                let mut response =
                    deny_response(denying_profile, decision, due_to_suspicion, now);
                annotate_rate_headers(&mut response, denying_profile, decision, now);
                annotate_risk_headers(&mut response, &analysis);
                return Ok(response);
            }

            let mut response = ready.oneshot(req).await.into_response();
            annotate_rate_headers(&mut response, profile, &normal, now);
            annotate_risk_headers(&mut response, &analysis);
            Ok(response)
        })
    }
}

fn deny_response(
    profile: &RateLimitProfile,
    decision: &RateLimitDecision,
    due_to_suspicion: bool,
    now: DateTime<Utc>,
) -> Response {
    let retry_after_secs = decision.retry_after_secs(now);
    let (code, docs_hint) = if due_to_suspicion {
        (
            codes::SUSPICIOUS_ACTIVITY,
            "Traffic from this identity matched automation heuristics. Slow down, send \
             browser telemetry headers if you are a legitimate client, and retry after \
             the indicated delay.",
        )
    } else {
        (
            codes::RATE_LIMITED,
            "Respect the X-RateLimit-* headers and retry after the indicated delay.",
        )
    };
    let body = ApiError {
        error: code.to_string(),
        message: format!(
            "Rate limit exceeded for profile '{}'. Retry after {retry_after_secs} seconds.",
            profile.name
        ),
        retry_after_seconds: Some(retry_after_secs),
        blocked: Some(decision.blocked),
        request_id: Uuid::now_v7().to_string(),
        docs_hint: Some(docs_hint.to_string()),
    };
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}

fn annotate_rate_headers(
    response: &mut Response,
    profile: &RateLimitProfile,
    decision: &RateLimitDecision,
    now: DateTime<Utc>,
) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&profile.max_requests.to_string()) {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.reset_at.timestamp().to_string()) {
        headers.insert("x-ratelimit-reset", value);
    }
    if !decision.allowed
        && let Ok(value) = HeaderValue::from_str(&decision.retry_after_secs(now).to_string())
    {
        headers.insert("retry-after", value);
    }
}

fn annotate_risk_headers(response: &mut Response, analysis: &Analysis) {
    if analysis.findings.is_empty() {
        return;
    }
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&format!("{:.2}", analysis.risk_score)) {
        headers.insert("x-risk-score", value);
    }
    let kinds = analysis
        .findings
        .iter()
        .map(|finding| finding.kind.as_str())
        .collect::<Vec<_>>()
        .join(",");
    if let Ok(value) = HeaderValue::from_str(&kinds) {
        headers.insert("x-risk-signals", value);
    }
}

fn block_event(
    signal: &RequestSignal,
    profile: &RateLimitProfile,
    decision: &RateLimitDecision,
    analysis: &Analysis,
    now: DateTime<Utc>,
) -> SecurityEvent {
    SecurityEvent {
        event_type: SecurityEventType::RateLimitExceeded,
        severity: "high".to_string(),
        identity: signal.identity.clone(),
        client_addr: signal.client_addr.clone(),
        user_agent: signal.user_agent.clone(),
        detail: json!({
            "profile": profile.name,
            "max_requests": profile.max_requests,
            "window_secs": profile.window_secs,
            "blocked_until": decision.blocked_until,
            "risk_score": analysis.risk_score,
            "findings": analysis.findings,
        }),
        occurred_at: now,
    }
}

fn suspicion_event(
    signal: &RequestSignal,
    analysis: &Analysis,
    decision: &RateLimitDecision,
    now: DateTime<Utc>,
) -> SecurityEvent {
    SecurityEvent {
        event_type: SecurityEventType::SuspiciousActivityBlocked,
        severity: "critical".to_string(),
        identity: signal.identity.clone(),
        client_addr: signal.client_addr.clone(),
        user_agent: signal.user_agent.clone(),
        detail: json!({
            "risk_score": analysis.risk_score,
            "findings": analysis.findings,
            "blocked_until": decision.blocked_until,
        }),
        occurred_at: now,
    }
}

fn degradation_event(
    signal: &RequestSignal,
    profile: &RateLimitProfile,
    now: DateTime<Utc>,
) -> SecurityEvent {
    SecurityEvent {
        event_type: SecurityEventType::StoreDegraded,
        severity: "medium".to_string(),
        identity: signal.identity.clone(),
        client_addr: signal.client_addr.clone(),
        user_agent: signal.user_agent.clone(),
        detail: json!({ "profile": profile.name, "action": "fail_open" }),
        occurred_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use std::sync::Arc;
    use tower::ServiceBuilder;

    use async_trait::async_trait;

    use crate::analyzer::BehaviorAnalyzer;
    use crate::config::{AnalyzerConfig, GatewayConfig, ProfileSet, StoreBackend};
    use crate::limiter::{CounterStore, MemoryCounterStore, RateLimiter, StoreError};

    fn test_config() -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig {
            profiles: ProfileSet::builtin(),
            analyzer: AnalyzerConfig::default(),
            risk_threshold: 0.7,
            origin_url: "http://127.0.0.1:0".into(),
            store_backend: StoreBackend::Memory,
            store_timeout_ms: 500,
            state_retention_secs: 86_400,
            sweep_interval_secs: 300,
            port: 0,
        })
    }

    fn gateway_with(
        store: Arc<dyn CounterStore>,
        sink: EventSink,
    ) -> impl Service<Request, Response = Response, Error = Infallible> + Clone {
        let layer = GatewayLayer::new(
            test_config(),
            BehaviorAnalyzer::new(AnalyzerConfig::default()),
            RateLimiter::new(store),
            sink,
        );
        ServiceBuilder::new().layer(layer).service(tower::service_fn(
            |_req: Request| async move { Ok::<_, Infallible>(StatusCode::OK.into_response()) },
        ))
    }

    fn gateway() -> impl Service<Request, Response = Response, Error = Infallible> + Clone {
        gateway_with(Arc::new(MemoryCounterStore::new()), EventSink::disabled())
    }

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn check_and_increment(
            &self,
            _profile: &RateLimitProfile,
            _identity: &str,
            _now: DateTime<Utc>,
        ) -> Result<RateLimitDecision, StoreError> {
            Err(StoreError::Timeout(500))
        }

        async fn sweep_stale(&self, _cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            Err(StoreError::Timeout(500))
        }
    }

    fn browser_request(path: &str, addr: &str) -> Request {
        HttpRequest::get(path)
            .header("user-agent", "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0")
            .header("accept-language", "en-US,en;q=0.9")
            .header("referer", "https://example.com/")
            .header("x-mouse-movements", "1")
            .header("x-forwarded-for", addr)
            .body(Body::empty())
            .unwrap()
    }

    fn curl_request(path: &str, addr: &str) -> Request {
        HttpRequest::get(path)
            .header("user-agent", "curl/8.0")
            .header("x-forwarded-for", addr)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn allowed_response_carries_rate_limit_metadata() {
        let gateway = gateway();
        let response = gateway
            .oneshot(browser_request("/api/orders", "203.0.113.10"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-ratelimit-limit").unwrap(),
            "100"
        );
        assert_eq!(
            response.headers().get("x-ratelimit-remaining").unwrap(),
            "99"
        );
        assert!(response.headers().contains_key("x-ratelimit-reset"));
    }

    #[tokio::test]
    async fn health_endpoint_bypasses_admission_control() {
        let gateway = gateway();
        // Far more requests than any profile would admit.
        for _ in 0..200 {
            let response = gateway
                .clone()
                .oneshot(browser_request("/health", "203.0.113.11"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn exhausted_profile_denies_with_retry_guidance() {
        let gateway = gateway();
        let addr = "203.0.113.12";
        // auth profile admits 10 per window
        for _ in 0..10 {
            let response = gateway
                .clone()
                .oneshot(browser_request("/auth/token", addr))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = gateway
            .clone()
            .oneshot(browser_request("/auth/token", addr))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        assert_eq!(
            response.headers().get("x-ratelimit-remaining").unwrap(),
            "0"
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "rate_limited");
        assert_eq!(body["blocked"], true);
        assert!(body["retry_after_seconds"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn suspicious_traffic_is_escalated_onto_the_tight_profile() {
        let gateway = gateway();
        let addr = "203.0.113.13";
        // The api profile alone would admit 100; the suspicious profile
        // admits 10. Automation traffic must hit the tight limit.
        let mut last = None;
        for _ in 0..20 {
            last = Some(
                gateway
                    .clone()
                    .oneshot(curl_request("/api/x", addr))
                    .await
                    .unwrap(),
            );
        }
        let response = last.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "suspicious_activity_blocked");
    }

    #[tokio::test]
    async fn risk_headers_present_when_findings_fired() {
        let gateway = gateway();
        let response = gateway
            .oneshot(curl_request("/api/x", "203.0.113.14"))
            .await
            .unwrap();
        assert!(response.headers().contains_key("x-risk-score"));
        let signals = response
            .headers()
            .get("x-risk-signals")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(signals.contains("known-automation-signature"));
    }

    #[tokio::test]
    async fn benign_traffic_has_no_risk_headers() {
        let gateway = gateway();
        let response = gateway
            .oneshot(browser_request("/about", "203.0.113.15"))
            .await
            .unwrap();
        assert!(!response.headers().contains_key("x-risk-score"));
    }

    #[tokio::test]
    async fn escalated_decisions_are_logged_allowed_or_denied() {
        let (sink, recorded) = EventSink::recording();
        let gateway = gateway_with(Arc::new(MemoryCounterStore::new()), sink);
        let addr = "203.0.113.20";
        // curl on an api path escalates from the first request; the
        // suspicious profile admits 10, so the tail of these is denied.
        for _ in 0..12 {
            gateway
                .clone()
                .oneshot(curl_request("/api/x", addr))
                .await
                .unwrap();
        }
        let entries = recorded.behavioral.lock().unwrap();
        assert_eq!(entries.len(), 12);
        assert!(entries.first().unwrap().allowed);
        assert!(!entries.last().unwrap().allowed);
        assert!(entries.iter().all(|entry| entry.risk_score >= 0.7));
    }

    #[tokio::test]
    async fn imposing_a_block_records_one_rate_limit_event() {
        let (sink, recorded) = EventSink::recording();
        let gateway = gateway_with(Arc::new(MemoryCounterStore::new()), sink);
        let addr = "203.0.113.21";
        // auth admits 10: request 11 imposes the block, 12 and 13 are
        // denied by the block already in force.
        for _ in 0..13 {
            gateway
                .clone()
                .oneshot(browser_request("/auth/token", addr))
                .await
                .unwrap();
        }
        let events = recorded.security.lock().unwrap();
        let blocks = events
            .iter()
            .filter(|event| event.event_type == SecurityEventType::RateLimitExceeded)
            .count();
        assert_eq!(blocks, 1);
    }

    #[tokio::test]
    async fn suspicious_denials_record_suspicion_events() {
        let (sink, recorded) = EventSink::recording();
        let gateway = gateway_with(Arc::new(MemoryCounterStore::new()), sink);
        let addr = "203.0.113.22";
        for _ in 0..14 {
            gateway
                .clone()
                .oneshot(curl_request("/api/x", addr))
                .await
                .unwrap();
        }
        let events = recorded.security.lock().unwrap();
        // Escalated from request 1; the suspicious profile denies from
        // request 11 on, each denial recording a suspicion event.
        let suspicion = events
            .iter()
            .filter(|event| event.event_type == SecurityEventType::SuspiciousActivityBlocked)
            .count();
        assert_eq!(suspicion, 4);
        // The block itself is recorded once, on the call that imposed it.
        let blocks = events
            .iter()
            .filter(|event| event.event_type == SecurityEventType::RateLimitExceeded)
            .count();
        assert_eq!(blocks, 1);
    }

    #[tokio::test]
    async fn degraded_store_records_degradation_for_both_checks() {
        let (sink, recorded) = EventSink::recording();
        let gateway = gateway_with(Arc::new(FailingStore), sink);
        let response = gateway
            .oneshot(curl_request("/api/x", "203.0.113.23"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let events = recorded.security.lock().unwrap();
        let degraded = events
            .iter()
            .filter(|event| event.event_type == SecurityEventType::StoreDegraded)
            .count();
        assert_eq!(degraded, 2);
    }
}
