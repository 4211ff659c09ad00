//! Metered gateway binary. Reads configuration exclusively from environment
//! variables (no dotenv).
use std::{
    net::SocketAddr,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};

use metered_gateway::{build_router, config::Config, db, tracing_setup, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env()?);
    tracing_setup::init(&config)?;

    info!(version = env!("CARGO_PKG_VERSION"), "gateway starting");

    if config.upstream_api_key.is_none() {
        info!("UPSTREAM_API_KEY not set, passing caller Authorization through");
    }
    if config.balance_billing {
        info!("balance billing enabled, calls debit owner balances");
    }

    let pool = db::connect(&config.database_path, config.database_max_connections).await?;
    let state = AppState::new(config.clone(), pool.clone())?;
    if state.limiter.is_enabled() {
        state.limiter.start_cleanup_task();
    } else {
        warn!("RATE_LIMIT_ENABLED is off, per-minute limits are not enforced");
    }
    let app = build_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.gateway_host, config.gateway_port)
        .parse()
        .with_context(|| {
            format!(
                "invalid GATEWAY_HOST:GATEWAY_PORT {}:{}",
                config.gateway_host, config.gateway_port
            )
        })?;

    info!(%addr, upstream = %config.upstream_url, "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(
        state.shutting_down.clone(),
        Duration::from_secs(config.shutdown_drain_secs),
    ))
    .await?;

    // Calls whose clients already left may still be settling.
    state.tasks.close();
    let drain = Duration::from_secs(config.shutdown_drain_secs);
    if tokio::time::timeout(drain, state.tasks.wait()).await.is_err() {
        warn!(pending = state.tasks.len(), "forwarded calls still running at shutdown");
    }

    pool.close().await;
    info!("gateway stopped");
    Ok(())
}

// ── Graceful shutdown ─────────────────────────────────────────────────────────

async fn shutdown_signal(shutting_down: Arc<AtomicBool>, drain: Duration) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c  => info!("received Ctrl+C"),
        _ = sigterm => info!("received SIGTERM"),
    }

    info!(drain_secs = drain.as_secs(), "shutting down, draining in-flight requests");
    shutting_down.store(true, std::sync::atomic::Ordering::SeqCst);

    // New proxy calls now get 503; give streams still relaying time to settle.
    tokio::time::sleep(drain).await;
}
