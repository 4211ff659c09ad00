//! Metered API-key gateway in front of a single upstream inference service.
//!
//! Every proxied call is authenticated against a stored API key, admitted
//! through rate, quota, token, model and balance checks, forwarded upstream
//! (buffered or as a relayed SSE stream), and settled into the usage and
//! balance ledgers exactly once. Configuration comes from environment
//! variables only.
pub mod auth;
pub mod balance;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod limits;
pub mod metering;
pub mod metrics;
pub mod owners;
pub mod proxy;
pub mod rate_limiter;
pub mod sse;
pub mod tracing_setup;
pub mod usage;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json},
    routing::{any, get},
    Router,
};
use sqlx::SqlitePool;
use tokio_util::task::TaskTracker;
use tower::ServiceBuilder;
use tower_http::{
    request_id::MakeRequestUuid, set_header::SetResponseHeaderLayer, trace::TraceLayer,
    ServiceBuilderExt,
};

use crate::{
    balance::BalanceLedger, config::Config, credentials::CredentialStore, error::GatewayError,
    limits::LimitEvaluator, metering::Meter, metrics::AppMetrics, owners::OwnerStore,
    rate_limiter::SlidingWindowLimiter, usage::UsageLedger,
};

/// Largest request body accepted for forwarding.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

// ── Shared application state ─────────────────────────────────────────────────

pub struct AppState {
    pub config: Arc<Config>,
    /// Shared connection pool to the upstream.
    pub client: reqwest::Client,
    pub pool: SqlitePool,
    pub owners: OwnerStore,
    pub credentials: CredentialStore,
    pub usage: UsageLedger,
    pub balance: BalanceLedger,
    pub limits: LimitEvaluator,
    pub meter: Meter,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub metrics: Arc<AppMetrics>,
    /// Set on SIGTERM/Ctrl-C; new proxy requests return 503.
    pub shutting_down: Arc<AtomicBool>,
    /// Forwarded calls and stream relays; drained before the pool closes.
    pub tasks: TaskTracker,
}

impl AppState {
    pub fn new(config: Arc<Config>, pool: SqlitePool) -> anyhow::Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(30))
            .use_rustls_tls()
            .build()?;

        let metrics = AppMetrics::new();
        let limiter = Arc::new(SlidingWindowLimiter::new(config.rate_limit_enabled));
        let usage = UsageLedger::new(pool.clone());

        Ok(Arc::new(AppState {
            client,
            owners: OwnerStore::new(pool.clone(), config.default_owner_quota),
            credentials: CredentialStore::new(
                pool.clone(),
                config.api_key_prefix.clone(),
                config.max_batch_size,
            ),
            balance: BalanceLedger::new(pool.clone(), metrics.clone()),
            limits: LimitEvaluator::new(limiter.clone(), usage.clone(), config.balance_billing),
            meter: Meter::new(
                pool.clone(),
                metrics.clone(),
                config.cost_per_1k_tokens,
                config.balance_billing,
            ),
            usage,
            limiter,
            metrics,
            pool,
            shutting_down: Arc::new(AtomicBool::new(false)),
            tasks: TaskTracker::new(),
            config,
        }))
    }
}

// ── Router construction ───────────────────────────────────────────────────────

pub fn build_router(state: Arc<AppState>) -> Router {
    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .propagate_x_request_id()
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::HeaderName::from_static("x-xss-protection"),
            HeaderValue::from_static("1; mode=block"),
        ));

    Router::new()
        // ── Public (no auth) ─────────────────────────────────────────────────
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        // ── Authenticated ─────────────────────────────────────────────────────
        .route("/gateway/usage", get(proxy::usage_handler))
        .route("/gateway/balance", get(proxy::balance_handler))
        .route("/v1/*path", any(proxy::proxy_handler))
        .route("/api/*path", any(proxy::proxy_handler))
        // ── Global middleware ─────────────────────────────────────────────────
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware)
        .with_state(state)
}

// ── Liveness / readiness handlers ────────────────────────────────────────────

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn ready_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, GatewayError> {
    if state.shutting_down.load(Ordering::Relaxed) {
        return Err(GatewayError::ShuttingDown);
    }
    sqlx::query("SELECT 1").execute(&state.pool).await?;
    Ok((StatusCode::OK, Json(serde_json::json!({"status": "ready"}))))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}
