//! Rendezvous Service
//!
//! Session orchestrator for anonymous pairing: matching, continuation votes
//! and voice-call signaling over a single WebSocket per client.
//!
//! # Servers
//!
//! - WebSocket server for clients at `/ws` (default: 0.0.0.0:8000)
//! - HTTP server for health endpoints and `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Create the store and seed any configured users
//! 4. Build the session hub and spawn its timer loop and expiry sweeper
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start WebSocket server, then mark ready
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use rendezvous_service::auth::{Authenticator, JwtAuthenticator};
use rendezvous_service::config::Config;
use rendezvous_service::dispatch::ws::{ws_router, WsState};
use rendezvous_service::hub::SessionHub;
use rendezvous_service::observability::{health_router, init_metrics_recorder, HealthState};
use rendezvous_service::store::{MemoryStore, Store};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long background tasks get to stop after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rendezvous_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Rendezvous Service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        seed_users = config.seed_users.len(),
        search_ticket_ttl_secs = config.session.search_ticket_ttl.as_secs(),
        notification_timeout_secs = config.session.notification_timeout.as_secs(),
        ring_timeout_secs = config.session.ring_timeout.as_secs(),
        auto_call_on_voice_match = config.session.auto_call_on_voice_match,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let store = Arc::new(MemoryStore::new());
    for username in &config.seed_users {
        store.create_user(username);
    }
    info!(users = config.seed_users.len(), "In-memory store ready");

    let root_token = CancellationToken::new();
    let health_state = Arc::new(HealthState::new(root_token.child_token()));
    let (hub, timer_rx) = SessionHub::new(
        Arc::clone(&store) as Arc<dyn Store>,
        config.session.clone(),
        root_token.child_token(),
    );
    let hub_tasks = hub.start(timer_rx);
    info!("Session hub started");

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listeners BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = root_token.child_token();
    let health_server = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    let ws_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    let authenticator: Arc<dyn Authenticator> =
        Arc::new(JwtAuthenticator::new(config.jwt_secret.clone()));
    let ws_app = ws_router(WsState {
        hub: Arc::clone(&hub),
        authenticator,
    })
    .layer(TraceLayer::new_for_http());

    let ws_listener = tokio::net::TcpListener::bind(ws_addr).await.map_err(|e| {
        error!(error = %e, addr = %ws_addr, "Failed to bind WebSocket server");
        format!("Failed to bind WebSocket server to {ws_addr}: {e}")
    })?;

    let ws_shutdown_token = root_token.child_token();
    let ws_server = tokio::spawn(async move {
        info!(addr = %ws_addr, "WebSocket server starting");
        let server = axum::serve(ws_listener, ws_app).with_graceful_shutdown(async move {
            ws_shutdown_token.cancelled().await;
            info!("WebSocket server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "WebSocket server failed");
        }
    });

    health_state.set_ready();
    info!("Rendezvous Service running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    // Severs every client channel, which lets the upgraded sockets finish.
    root_token.cancel();

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        for task in hub_tasks.into_iter().chain([ws_server, health_server]) {
            if let Err(e) = task.await {
                warn!(error = %e, "Task ended abnormally during shutdown");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Shutdown grace period elapsed with tasks still running"
        );
    }

    info!("Rendezvous Service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
