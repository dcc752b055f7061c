use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod analyzer;
mod classify;
mod config;
mod error;
mod events;
mod identity;
mod limiter;
mod middleware;
mod origin;
mod signal;
mod state;

use analyzer::BehaviorAnalyzer;
use config::{GatewayConfig, StoreBackend};
use events::EventSink;
use limiter::{CounterStore, MemoryCounterStore, PgCounterStore, RateLimiter};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sentra_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Configuration errors are fatal here, never at request time.
    let config = Arc::new(
        GatewayConfig::from_env()
            .unwrap_or_else(|err| panic!("invalid gateway configuration: {err}")),
    );

    let (store, sink, identity_layer): (
        Arc<dyn CounterStore>,
        EventSink,
        Option<identity::InjectIdentityLayer>,
    ) = match config.store_backend {
        StoreBackend::Postgres => {
            let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
            let pool = PgPoolOptions::new()
                .max_connections(20)
                .connect(&database_url)
                .await
                .expect("Failed to connect to database");

            sqlx::migrate!("../migrations")
                .run(&pool)
                .await
                .expect("Failed to run migrations");

            (
                Arc::new(PgCounterStore::new(pool.clone(), config.store_timeout_ms)),
                EventSink::postgres(pool.clone()),
                Some(identity::InjectIdentityLayer::new(pool)),
            )
        }
        StoreBackend::Memory => {
            tracing::warn!("running on the in-memory counter store; state is process-local");
            (Arc::new(MemoryCounterStore::new()), EventSink::disabled(), None)
        }
    };

    let analyzer = BehaviorAnalyzer::new(config.analyzer.clone());
    let limiter = RateLimiter::new(store);

    spawn_retention_sweeper(config.clone(), limiter.clone(), analyzer.clone());

    let app_state = state::AppState {
        config: config.clone(),
        http: reqwest::Client::new(),
    };

    let gateway_layer = middleware::gateway::GatewayLayer::new(
        config.clone(),
        analyzer,
        limiter,
        sink,
    );

    let app = Router::new()
        .route("/health", get(health_check))
        .fallback(origin::forward)
        .layer(gateway_layer)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .option_layer(identity_layer),
        )
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Sentra gateway listening on {}, origin {}", addr, config.origin_url);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}

/// Best-effort, idempotent pruning of stale counter rows and analyzer
/// history. Failures are logged and retried on the next tick.
fn spawn_retention_sweeper(
    config: Arc<GatewayConfig>,
    limiter: RateLimiter,
    analyzer: BehaviorAnalyzer,
) {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(config.sweep_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let cutoff = now - Duration::seconds(config.state_retention_secs);
            match limiter.sweep_stale(cutoff).await {
                Ok(removed) if removed > 0 => {
                    tracing::debug!(removed, "swept stale rate-limit state");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "rate-limit state sweep failed"),
            }
            let pruned = analyzer.prune_stale(now).await;
            if pruned > 0 {
                tracing::debug!(pruned, "pruned idle behavioral histories");
            }
        }
    });
}
