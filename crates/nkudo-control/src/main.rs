//! nkudo control plane entry point.
//!
//! Connects the PostgreSQL pool, builds the shared state, then starts
//! the Axum HTTP server with graceful shutdown. A background scanner
//! marks silent sites and agents offline and is cancelled on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use axum::middleware as axum_mw;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use nkudo_control::auth::{admin_auth_middleware, agent_auth_middleware};
use nkudo_control::config::ServerConfig;
use nkudo_control::repository;
use nkudo_control::routes;
use nkudo_control::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(addr = %config.bind_addr, "nkudo control plane starting");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(16)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await
        .context("failed to connect to PostgreSQL")?;

    let state = Arc::new(AppState::new(pool, config.clone()));

    // Shutdown signal channel.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn the connectivity scanner.
    let scanner_handle = {
        let state = Arc::clone(&state);
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            offline_scanner(&state, &mut rx).await;
        })
    };

    let app = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    // Wait for the scanner to finish (bounded by the shutdown grace).
    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(config.shutdown_grace, scanner_handle).await;

    state.pool.close().await;
    info!("control plane stopped");
    Ok(())
}

/// Build the Axum router with all routes and middleware.
fn build_router(state: Arc<AppState>) -> Router {
    // Agent routes go through client-certificate auth.
    let agent_routes = Router::new()
        .nest("/v1/agent", routes::agent::router())
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            agent_auth_middleware,
        ));

    // Admin bootstrap routes behind the bearer token.
    let admin_routes = Router::new()
        .nest("/v1/admin", routes::admin::router())
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            admin_auth_middleware,
        ));

    // Enrollment is concurrency-limited: CSR signing is the most
    // expensive unauthenticated work the server does.
    let enroll_routes = Router::new()
        .nest("/v1/enroll", routes::enroll::router())
        .layer(tower::limit::ConcurrencyLimitLayer::new(16));

    Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .merge(enroll_routes)
        .merge(agent_routes)
        .merge(admin_routes)
        .nest("/v1/pki", routes::pki::router())
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

/// Maximum retries per tick when storage is unreachable.
const SCAN_MAX_RETRIES: u32 = 3;

/// Background worker that flips silent sites and agents to offline.
///
/// Transient storage failures retry with exponential backoff (1s, 2s,
/// 4s) before giving up on the tick; a consecutive-failure counter
/// escalates log severity so persistent outages stand out.
async fn offline_scanner(state: &AppState, shutdown: &mut watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(state.config.offline_scan_interval);
    let mut consecutive_failures: u32 = 0;
    info!(
        interval_secs = state.config.offline_scan_interval.as_secs(),
        offline_after_secs = state.config.offline_after.as_secs(),
        "offline scanner started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match scan_with_retries(state, shutdown).await {
                    Ok(None) => {
                        info!("offline scanner shutting down");
                        return;
                    }
                    Ok(Some((sites, agents))) => {
                        consecutive_failures = 0;
                        if sites > 0 || agents > 0 {
                            info!(sites, agents, "marked silent resources offline");
                        }
                    }
                    Err(last_err) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        if consecutive_failures >= 5 {
                            tracing::error!(
                                error = %last_err,
                                consecutive_failures,
                                "offline scan persistently failing — storage may be down"
                            );
                        } else {
                            warn!(
                                error = %last_err,
                                consecutive_failures,
                                "offline scan failed after retries, will retry next tick"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("offline scanner shutting down");
                return;
            }
        }
    }
}

/// Attempt one scan with exponential backoff. Returns:
/// - `Ok(Some((sites, agents)))` on success
/// - `Ok(None)` if shutdown was signalled during retry
/// - `Err(last_error)` if all retries exhausted
async fn scan_with_retries(
    state: &AppState,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<(u64, u64)>, String> {
    let mut last_err = String::new();

    for attempt in 0..=SCAN_MAX_RETRIES {
        let sites =
            repository::mark_silent_sites_offline(&state.pool, state.config.offline_after)
                .await;
        let result = match sites {
            Ok(sites) => {
                repository::mark_silent_agents_offline(
                    &state.pool,
                    state.config.offline_after,
                )
                .await
                .map(|agents| (sites, agents))
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(counts) => return Ok(Some(counts)),
            Err(e) => {
                last_err = e.to_string();
                if attempt == SCAN_MAX_RETRIES {
                    break;
                }
                let backoff = Duration::from_secs(1u64 << attempt);
                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => return Ok(None),
                }
            }
        }
    }

    Err(last_err)
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
