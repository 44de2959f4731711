//! Room Coordinator
//!
//! Realtime coordinator for collaborative code-editing rooms.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the room metadata mirror (Redis, when `REDIS_URL` is set)
//! 4. Spawn the registry actor
//! 5. Serve HTTP + WebSocket until a shutdown signal arrives

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::secret::ExposeSecret;
use room_service::actors::{ActorMetrics, ConnectionSettings, RegistryHandle, RegistrySettings};
use room_service::auth::JwtIdentityResolver;
use room_service::config::Config;
use room_service::observability::{metrics::init_metrics_recorder, HealthState};
use room_service::routes::{self, AppState};
use room_service::store::{NoopRoomStore, RedisRoomStore, RoomStore};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Time given to connection tasks to flush their close frames.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "room_service=debug,tower_http=debug".into());
    let subscriber = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting Room Coordinator");
    info!(
        bind_address = %config.bind_address,
        outbound_queue_capacity = config.outbound_queue_capacity,
        room_record_ttl_seconds = config.room_record_ttl_seconds,
        max_participants = config.max_participants,
        ping_interval_seconds = config.ping_interval_seconds,
        idle_timeout_seconds = config.idle_timeout_seconds,
        mirror_enabled = config.redis_url.is_some(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let store: Arc<dyn RoomStore> = match &config.redis_url {
        Some(url) => {
            info!("Connecting to Redis...");
            let store = RedisRoomStore::connect(url.expose_secret())
                .await
                .map_err(|e| {
                    error!(error = %e, "Failed to connect to Redis");
                    e
                })?;
            info!("Redis connection established");
            Arc::new(store)
        }
        None => {
            warn!("REDIS_URL not set, room metadata will not be mirrored");
            Arc::new(NoopRoomStore)
        }
    };

    let actor_metrics = ActorMetrics::new();
    let registry = RegistryHandle::new(
        Arc::clone(&store),
        RegistrySettings {
            record_ttl: config.room_record_ttl(),
            max_participants: config.max_participants,
        },
        Arc::clone(&actor_metrics),
    );
    let shutdown_token = registry.child_token();

    let health_state = Arc::new(HealthState::new());
    let state = Arc::new(AppState {
        registry: registry.clone(),
        store,
        identity: Arc::new(JwtIdentityResolver::new(config.jwt_secret.clone())),
        connection_settings: ConnectionSettings::from_config(&config),
        metrics: actor_metrics,
    });

    let app = routes::build_routes(
        state,
        Arc::clone(&health_state),
        prometheus_handle,
        config.request_timeout(),
    );

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        e
    })?;

    // Bind before reporting ready to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind listener");
        e
    })?;
    health_state.mark_serving();
    info!(addr = %addr, "Room Coordinator listening");

    let server_token = shutdown_token.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                server_token.cancelled().await;
                info!("HTTP server shutting down");
            })
            .await
    });

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.mark_draining();

    // Cancels rooms and connections as well as the HTTP server
    registry.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
        Err(e) => error!(error = %e, "HTTP server task panicked"),
    }

    info!("Room Coordinator shutdown complete");
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
