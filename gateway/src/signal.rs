//! Signal extraction: normalize one inbound request into a `RequestSignal`.
//!
//! Pure transform over headers and URI. Malformed telemetry never rejects a
//! request — every parse failure degrades to absent/false/zero.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::identity::ResolvedIdentity;

/// Ephemeral per-request telemetry record consumed by the analyzer.
#[derive(Debug, Clone)]
pub struct RequestSignal {
    /// Rate-limit key: authenticated user id when available, else address
    pub identity: String,
    pub user_id: Option<Uuid>,
    pub client_addr: String,
    pub path: String,
    pub method: String,
    pub declared_payload_size: u64,
    pub user_agent: String,
    pub referer: Option<String>,
    pub accept_language: Option<String>,
    pub mouse_movements: bool,
    pub keyboard_activity: bool,
    pub asset_requests: bool,
    pub screen_resolution: Option<String>,
    pub timezone: Option<String>,
    pub form_fill_ms: u64,
    pub click_pattern: Vec<String>,
    pub navigation_pattern: Vec<String>,
    pub session_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl RequestSignal {
    /// True when none of the passive browser-fingerprint signals were seen.
    pub fn fingerprint_absent(&self) -> bool {
        self.screen_resolution.is_none() && self.timezone.is_none() && self.accept_language.is_none()
    }
}

/// Build a `RequestSignal` from the request. Identity preference: the
/// authenticated user injected by the identity layer beats the network
/// address, so logged-in abusers can't evade limits by rotating addresses.
pub fn extract(req: &Request, now: DateTime<Utc>) -> RequestSignal {
    let headers = req.headers();
    let user_id = req
        .extensions()
        .get::<ResolvedIdentity>()
        .map(|identity| identity.user_id);
    let client_addr = client_addr(req);
    let identity = match user_id {
        Some(id) => format!("user:{id}"),
        None => format!("addr:{client_addr}"),
    };

    RequestSignal {
        identity,
        user_id,
        client_addr,
        path: req.uri().path().to_string(),
        method: req.method().to_string(),
        declared_payload_size: header_u64(headers, "content-length"),
        user_agent: header_string(headers, "user-agent").unwrap_or_default(),
        referer: header_string(headers, "referer"),
        accept_language: header_string(headers, "accept-language"),
        mouse_movements: header_flag(headers, "x-mouse-movements"),
        keyboard_activity: header_flag(headers, "x-keyboard-activity"),
        asset_requests: header_flag(headers, "x-asset-requests"),
        screen_resolution: header_string(headers, "x-screen-resolution"),
        timezone: header_string(headers, "x-timezone"),
        form_fill_ms: header_u64(headers, "x-form-fill-speed"),
        click_pattern: header_tokens(headers, "x-click-pattern"),
        navigation_pattern: header_tokens(headers, "x-navigation-pattern"),
        session_id: header_string(headers, "x-session-id"),
        received_at: now,
    }
}

/// Client network address: first `X-Forwarded-For` hop, then `X-Real-IP`,
/// then the socket peer address.
fn client_addr(req: &Request) -> String {
    let headers = req.headers();
    if let Some(forwarded) = header_string(headers, "x-forwarded-for")
        && let Some(first) = forwarded.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(real_ip) = header_string(headers, "x-real-ip") {
        return real_ip;
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_string(headers: &axum::http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn header_flag(headers: &axum::http::HeaderMap, name: &str) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .is_some_and(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

fn header_u64(headers: &axum::http::HeaderMap, name: &str) -> u64 {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

fn header_tokens(headers: &axum::http::HeaderMap, name: &str) -> Vec<String> {
    header_string(headers, name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
