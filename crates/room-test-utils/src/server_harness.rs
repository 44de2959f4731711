//! Test server harness for E2E testing
//!
//! Provides `TestRoomServer` for spawning real coordinator instances in tests.

use crate::memory_store::MemoryRoomStore;
use common::jwt::issue_participant_token;
use common::secret::SecretString;
use room_service::actors::{ActorMetrics, ConnectionSettings, RegistryHandle, RegistrySettings};
use room_service::auth::JwtIdentityResolver;
use room_service::config::DEFAULT_MAX_PARTICIPANTS;
use room_service::observability::{metrics::prometheus_builder, HealthState};
use room_service::routes::{self, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Secret shared by the harness and the tokens it issues.
pub const TEST_JWT_SECRET: &str = "room-test-utils-jwt-secret-0123456789";

/// Knobs for a spawned server.
#[derive(Debug, Clone)]
pub struct TestServerOptions {
    pub connection: ConnectionSettings,
    pub record_ttl: Duration,
    pub max_participants: usize,
    pub store: Arc<MemoryRoomStore>,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            record_ttl: Duration::from_secs(60),
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            store: Arc::new(MemoryRoomStore::new()),
        }
    }
}

/// Test harness for spawning the room coordinator in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_listing_e2e() -> Result<()> {
///     let server = TestRoomServer::spawn().await?;
///
///     let response = reqwest::get(format!("{}/api/v1/rooms", server.url())).await?;
///
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestRoomServer {
    addr: SocketAddr,
    registry: RegistryHandle,
    store: Arc<MemoryRoomStore>,
    metrics: Arc<ActorMetrics>,
    _handle: JoinHandle<()>,
}

impl TestRoomServer {
    /// Spawn a server with default options.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(TestServerOptions::default()).await
    }

    /// Spawn a new test server instance.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the HTTP server in the background
    pub async fn spawn_with(options: TestServerOptions) -> Result<Self, anyhow::Error> {
        let metrics = ActorMetrics::new();
        let registry = RegistryHandle::new(
            options.store.clone(),
            RegistrySettings {
                record_ttl: options.record_ttl,
                max_participants: options.max_participants,
            },
            Arc::clone(&metrics),
        );

        let state = Arc::new(AppState {
            registry: registry.clone(),
            store: options.store.clone(),
            identity: Arc::new(JwtIdentityResolver::new(SecretString::from(
                TEST_JWT_SECRET.to_string(),
            ))),
            connection_settings: options.connection,
            metrics: Arc::clone(&metrics),
        });

        // A detached recorder: tests must not race on the global one.
        let prometheus_handle = prometheus_builder()
            .map_err(|e| anyhow::anyhow!("Failed to build metrics recorder: {}", e))?
            .build_recorder()
            .handle();

        let health_state = Arc::new(HealthState::new());
        health_state.mark_serving();

        let app = routes::build_routes(
            state,
            health_state,
            prometheus_handle,
            Duration::from_secs(5),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            registry,
            store: options.store,
            metrics,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the WebSocket endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn store(&self) -> &MemoryRoomStore {
        &self.store
    }

    pub fn metrics(&self) -> &ActorMetrics {
        &self.metrics
    }

    /// Issue a valid participant token for `participant_id`.
    pub fn token_for(&self, participant_id: &str) -> String {
        issue_participant_token(
            participant_id,
            Duration::from_secs(300),
            &SecretString::from(TEST_JWT_SECRET.to_string()),
        )
        .expect("Failed to issue test token")
    }
}

impl Drop for TestRoomServer {
    fn drop(&mut self) {
        self.registry.cancel();
        self._handle.abort();
    }
}
