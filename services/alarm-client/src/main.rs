//! Immersive Alarm client
//!
//! Local web client for the alarm backend:
//! 1. Signs the user in with PKCE against the identity provider
//! 2. Hands the authorization code to the backend for exchange
//! 3. Shows calendar events and toggles alarms on them
//! 4. Shows alarm activity history, with CSV export

mod auth;
mod config;
mod error;
mod metrics;
mod request;
mod views;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono_tz::Tz;
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use alarm_api::{AlarmBook, BackendClient};
use alarm_auth::{CallbackHandler, IdentityProvider, LocalStorage, SessionStore, TokenClient};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    identity: Arc<IdentityProvider>,
    storage: Arc<LocalStorage>,
    sessions: SessionStore,
    callback: Arc<CallbackHandler>,
    backend: BackendClient,
    alarms: Arc<RwLock<AlarmBook>>,
    /// Zone the calendar is grouped in and alarm start times are sent with
    time_zone: Tz,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

impl AppState {
    fn new(
        identity: IdentityProvider,
        storage: Arc<LocalStorage>,
        http: reqwest::Client,
        backend_url: &str,
        time_zone: Tz,
        prometheus: PrometheusHandle,
    ) -> Self {
        let sessions = SessionStore::new(storage.clone());
        let callback = CallbackHandler::new(
            storage.clone(),
            sessions.clone(),
            TokenClient::new(http.clone(), backend_url),
        );
        Self {
            identity: Arc::new(identity),
            storage,
            sessions,
            callback: Arc::new(callback),
            backend: BackendClient::new(http, backend_url),
            alarms: Arc::new(RwLock::new(AlarmBook::new())),
            time_zone,
            started_at: Instant::now(),
            prometheus,
        }
    }
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` caps concurrent requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/auth/login", get(auth::login))
        .route("/auth/callback", get(auth::callback))
        .route("/auth/status", get(auth::status))
        .route("/auth/logout", post(auth::logout))
        .route("/calendar", get(views::calendar))
        .route(
            "/alarm",
            post(views::enable_alarm).delete(views::disable_alarm),
        )
        .route("/alarm/settings", put(views::update_settings))
        .route("/activity", get(views::activity))
        .route("/activity/export.csv", get(views::export_activity))
        .layer(axum::middleware::from_fn(request::assign))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting immersive-alarm-client");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        authorize_endpoint = %config.identity.authorize_endpoint,
        "configuration loaded"
    );

    let storage = LocalStorage::open(config.storage.path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open storage at {}",
                config.storage.path.display()
            )
        })?;
    info!(path = %storage.path().display(), "storage opened");

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.backend.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let app_state = AppState::new(
        config.identity.provider(),
        Arc::new(storage),
        http,
        &config.backend.base_url,
        config.backend.time_zone,
        prometheus_handle,
    );
    info!(
        backend_url = %app_state.backend.base_url(),
        time_zone = %app_state.time_zone,
        "backend client ready"
    );

    // Recover a session persisted by a previous run
    match app_state.sessions.refresh().await {
        Some(session) => info!(user_id = %session.user.id, "resumed persisted session"),
        None => info!("no persisted session, sign-in required"),
    }

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: status, whether a session is active, uptime.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "healthy",
        "authenticated": state.sessions.is_authenticated().await,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
