//! Room Controller
//!
//! Session orchestration and WebSocket signaling for classroom rooms.
//!
//! # Servers
//!
//! - WebSocket signaling at `/ws` (default: 0.0.0.0:3000)
//! - HTTP health endpoints and `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Start health HTTP server (not ready yet)
//! 4. Connect to Postgres (course directory, chat history)
//! 5. Start the media worker pool
//! 6. Start the room registry
//! 7. Start the signaling server and mark ready
//! 8. Wait for a shutdown signal or a fatal worker failure

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::secret::ExposeSecret;
use room_controller::actors::{ActorMetrics, RoomRegistryHandle};
use room_controller::auth::JwtIdentityVerifier;
use room_controller::chat::PgChatStore;
use room_controller::config::Config;
use room_controller::directory::PgCourseDirectory;
use room_controller::media::{FatalSignal, WorkerPool, WorkerPoolConfig};
use room_controller::observability::{health_router, init_metrics_recorder, HealthState};
use room_controller::signaling::ws::signaling_router;
use room_controller::signaling::SignalingState;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "room_controller=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Room Controller");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        num_workers = config.num_workers,
        room_capacity = config.room_capacity,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow::anyhow!(e)
    })?;

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    // Health server first so probes answer during startup
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        anyhow::anyhow!("Invalid health bind address: {e}")
    })?;
    let health_app = health_router(Arc::clone(&health_state), Some(prometheus_handle));
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            anyhow::anyhow!("Failed to bind health server to {health_addr}: {e}")
        })?;
    let health_shutdown = shutdown_token.child_token();
    tokio::spawn(async move {
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });
    info!(addr = %health_addr, "Health server started");

    info!("Connecting to database...");
    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(config.database_url.expose_secret())
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            e
        })?;
    info!("Database connection established");

    let fatal = FatalSignal::new();
    let pool_token = CancellationToken::new();
    let pool = WorkerPool::start(
        WorkerPoolConfig::from_config(&config),
        pool_token.clone(),
        fatal.clone(),
    )
    .map_err(|e| {
        error!(error = %e, "Failed to start media workers");
        anyhow::anyhow!("Failed to start media workers: {e}")
    })?;

    let actor_metrics = ActorMetrics::new();
    let registry = RoomRegistryHandle::new(
        Arc::clone(&pool),
        config.room_capacity,
        Arc::clone(&actor_metrics),
    );
    info!("Room registry started");

    let state = Arc::new(SignalingState::new(
        &config,
        registry.clone(),
        Arc::new(PgCourseDirectory::new(db_pool.clone())),
        Arc::new(PgChatStore::new(db_pool.clone())),
        Arc::new(JwtIdentityVerifier::new(config.jwt_secret.clone())),
        Arc::clone(&actor_metrics),
    ));

    let signaling_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid signaling bind address");
        anyhow::anyhow!("Invalid signaling bind address: {e}")
    })?;
    let signaling_app = signaling_router(state).layer(TraceLayer::new_for_http());
    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            anyhow::anyhow!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;
    let signaling_shutdown = shutdown_token.child_token();
    tokio::spawn(async move {
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });
    info!(addr = %signaling_addr, "Signaling server started");

    health_state.set_ready();
    info!("Room Controller running - press Ctrl+C to shutdown");

    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
        }
        () = fatal.tripped() => {
            // A media worker died: no room on it can be trusted any more.
            health_state.set_not_ready();
            error!(
                reason = fatal.reason().as_deref().unwrap_or("unknown"),
                grace_ms = u64::try_from(config.worker_death_grace.as_millis()).unwrap_or(u64::MAX),
                "Media worker died, exiting"
            );
            tokio::time::sleep(config.worker_death_grace).await;
            std::process::exit(1);
        }
    }

    health_state.set_not_ready();
    shutdown_token.cancel();

    let deadline = config.shutdown_timeout;
    if let Err(e) = registry.shutdown(deadline).await {
        warn!(error = %e, "Room registry shutdown error");
    }
    pool.shutdown(deadline).await;
    db_pool.close().await;

    info!("Room Controller shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
