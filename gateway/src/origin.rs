//! Pass-through to the protected origin.
//!
//! Runs as the innermost handler: anything the gateway admits is replayed
//! against the origin and the origin's response is returned as-is (the
//! orchestrator adds the rate-limit headers on the way out). Bodies are
//! streamed in both directions, so uploads and downloads of any size pass
//! through without being buffered in the gateway.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};

use crate::error::AppError;
use crate::state::AppState;

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub async fn forward(State(state): State<AppState>, req: Request) -> Result<Response, AppError> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.config.origin_url.trim_end_matches('/'), path_and_query);

    let mut upstream = state
        .http
        .request(parts.method, &url)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));
    for (name, value) in &parts.headers {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            upstream = upstream.header(name.clone(), value.clone());
        }
    }

    let origin_response = upstream.send().await.map_err(AppError::Origin)?;

    let status = origin_response.status();
    let headers = origin_response.headers().clone();

    let mut response =
        (status, Body::from_stream(origin_response.bytes_stream())).into_response();
    for (name, value) in &headers {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            response.headers_mut().insert(name, value.clone());
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::Router;
    use axum::body::Bytes;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::post;

    use crate::config::{AnalyzerConfig, GatewayConfig, ProfileSet, StoreBackend};

    async fn spawn_echo_origin() -> String {
        let app = Router::new()
            .route("/echo", post(|body: Bytes| async move { body }))
            .layer(axum::extract::DefaultBodyLimit::disable());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn state_for(origin_url: String) -> AppState {
        AppState {
            config: Arc::new(GatewayConfig {
                profiles: ProfileSet::builtin(),
                analyzer: AnalyzerConfig::default(),
                risk_threshold: 0.7,
                origin_url,
                store_backend: StoreBackend::Memory,
                store_timeout_ms: 500,
                state_retention_secs: 86_400,
                sweep_interval_secs: 300,
                port: 0,
            }),
            http: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn large_request_bodies_are_forwarded_intact() {
        let state = state_for(spawn_echo_origin().await);
        // 20 MiB, well past anything that should be held in memory at once.
        let payload = vec![0x5au8; 20 * 1024 * 1024];
        let req = HttpRequest::post("/echo")
            .body(Body::from(payload.clone()))
            .unwrap();

        let response = forward(State(state), req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(bytes.len(), payload.len());
        assert_eq!(&bytes[..], &payload[..]);
    }

    #[tokio::test]
    async fn origin_status_and_body_pass_through() {
        let state = state_for(spawn_echo_origin().await);
        let req = HttpRequest::post("/echo")
            .body(Body::from("hello"))
            .unwrap();

        let response = forward(State(state), req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"hello");
    }
}
