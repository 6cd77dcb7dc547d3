//! Cloud Code Proxy
//!
//! Single-binary Rust service that exposes an Anthropic-compatible Messages
//! API and load-balances requests across a pool of Cloud Code accounts:
//! 1. Loads config and the on-disk account record store
//! 2. Builds the Account Pool, Request Executor, and background Quota Refresher
//! 3. Serves `/v1/messages` on the public listener and the account management
//!    API on a separate admin listener (spec.md §3, §7)

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;
mod service;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cloud_code_auth::AccountStore;
use cloud_code_executor::{CancelHandle, Executor, PassthroughRequestBuilder, ReqwestUpstream};
use cloud_code_pool::{NullQuotaProbe, Pool, spawn_refresh_task};

use crate::admin::AdminState;
use crate::config::Config;
use crate::proxy::MessagesState;
use crate::service::ServiceMetrics;

/// State shared by the public listener's non-proxy routes (`/health`, `/metrics`).
#[derive(Clone)]
struct PublicState {
    pool: Arc<Pool>,
    metrics: ServiceMetrics,
    prometheus: metrics_exporter_prometheus::PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting cloud-code-proxy");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .await
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        admin_listen_addr = %config.proxy.admin_listen_addr,
        accounts_path = %config.proxy.accounts_path.display(),
        endpoints = config.proxy.endpoints.len(),
        strategy = %config.executor.strategy,
        "configuration loaded"
    );

    let store = Arc::new(
        AccountStore::load(config.proxy.accounts_path.clone())
            .await
            .context("failed to load account record store")?,
    );
    let mut records = store.all().await;
    // `AccountStore::all` has no ordering guarantee (it snapshots a HashMap);
    // `Pool::new` requires the caller to hand it addition order so round-robin
    // stays deterministic across restarts (spec.md §3).
    records.sort_by_key(|r| r.added_at);
    info!(accounts = records.len(), "account records loaded");

    let http_client = reqwest::Client::new();
    let pool = Arc::new(Pool::new(
        records,
        store,
        cloud_code_pool::by_name(&config.executor.strategy),
        http_client.clone(),
    ));

    let executor = Arc::new(
        Executor::new(
            pool.clone(),
            Arc::new(ReqwestUpstream::new(http_client.clone())),
            Arc::new(PassthroughRequestBuilder),
            config.executor.clone(),
            config.proxy.endpoints.clone(),
        )
        .with_fallback_chain(config.proxy.fallback_chain.clone()),
    );

    let refresh_handle = spawn_refresh_task(
        pool.clone(),
        Arc::new(NullQuotaProbe),
        Duration::from_millis(config.executor.quota_refresh_interval_ms),
        Duration::from_millis(config.executor.quota_stagger_delay_ms),
    );

    let service_metrics = ServiceMetrics::new();
    let (shutdown_handle, shutdown_signal) = CancelHandle::new();

    let messages_state = MessagesState {
        executor,
        fallback_enabled: config.proxy.fallback_enabled,
        metrics: service_metrics.clone(),
        shutdown: shutdown_signal.clone(),
    };

    let prometheus = metrics::install_recorder();
    let public_state = PublicState {
        pool: pool.clone(),
        metrics: service_metrics.clone(),
        prometheus,
    };

    let public_app = Router::new()
        .route(
            "/v1/messages",
            axum::routing::post(proxy::messages_handler),
        )
        .with_state(messages_state)
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(public_state);

    let admin_state = AdminState::new(pool, http_client);
    let admin_app = admin::build_admin_router(admin_state);

    let public_listener = TcpListener::bind(config.proxy.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.proxy.listen_addr))?;
    let admin_listener = TcpListener::bind(config.proxy.admin_listen_addr)
        .await
        .with_context(|| format!("failed to bind admin listener to {}", config.proxy.admin_listen_addr))?;

    info!(addr = %config.proxy.listen_addr, "public listener ready");
    info!(addr = %config.proxy.admin_listen_addr, "admin listener ready");

    let public_server = axum::serve(public_listener, public_app)
        .with_graceful_shutdown(wait_for_cancel(shutdown_signal.clone()));
    let admin_server = axum::serve(admin_listener, admin_app)
        .with_graceful_shutdown(wait_for_cancel(shutdown_signal));

    let servers = async {
        tokio::try_join!(
            async { public_server.await.context("public server error") },
            async { admin_server.await.context("admin server error") },
        )
    };
    tokio::pin!(servers);

    tokio::select! {
        res = &mut servers => {
            res?;
        }
        _ = shutdown_signal_future() => {
            // Cancel in-flight attempts at the same moment axum stops
            // accepting new connections, instead of after both servers have
            // already drained on their own (spec.md §5's drain window).
            info!("shutdown signal received, draining in-flight requests");
            shutdown_handle.cancel();
            match tokio::time::timeout(config.executor.drain_timeout(), servers).await {
                Ok(res) => res?,
                Err(_) => {
                    tracing::warn!(
                        drain_timeout_ms = config.executor.drain_timeout_ms,
                        "drain timeout exceeded, exiting with requests still in flight"
                    );
                }
            }
        }
    }

    refresh_handle.stop();
    info!("shutdown complete");
    Ok(())
}

/// `GET /health` — pool health plus basic uptime/request counters.
async fn health_handler(State(state): State<PublicState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let pool_health = state.pool.health().await;

    let body = serde_json::json!({
        "status": if pool_health["healthy"].as_bool().unwrap_or(false) { "healthy" } else { "degraded" },
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
        "pool": pool_health,
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// `GET /metrics` — Prometheus text exposition.
async fn metrics_handler(State(state): State<PublicState>) -> impl IntoResponse {
    let models = state.pool.known_models().await;
    let counts = cloud_code_pool::per_model_counts(&state.pool, &models).await;
    metrics::record_pool_counts(&counts);
    state.prometheus.render()
}

/// Resolves once `signal` has been cancelled. Passed to
/// `with_graceful_shutdown` so both listeners stop accepting new connections
/// at the exact moment in-flight attempts are told to give up, rather than
/// each listener waiting on its own independent OS-signal future.
async fn wait_for_cancel(mut signal: cloud_code_executor::CancelSignal) {
    while !*signal.borrow() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal_future() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
