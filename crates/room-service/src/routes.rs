//! HTTP routes for the room coordinator.
//!
//! Defines the Axum router, application state and the WebSocket bridge.

use crate::actors::{ActorMetrics, ConnectionActor, ConnectionSettings, RegistryHandle, WireFrame};
use crate::auth::IdentityResolver;
use crate::errors::RoomError;
use crate::observability::{health_router, HealthState};
use crate::protocol::RoomSummary;
use crate::store::{RoomRecord, RoomStore};

use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Path, Query, Request, State,
    },
    http::HeaderMap,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use common::types::{ParticipantId, RoomId};
use futures_util::{future, SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, instrument};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,

    /// Metadata mirror, read by the room lookup endpoint.
    pub store: Arc<dyn RoomStore>,

    /// Resolves the participant behind a request.
    pub identity: Arc<dyn IdentityResolver>,

    pub connection_settings: ConnectionSettings,

    pub metrics: Arc<ActorMetrics>,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/health`, `/ready` - Liveness and readiness probes
/// - `/metrics` - Prometheus metrics endpoint
/// - `/ws` - WebSocket upgrade (authenticated before upgrade)
/// - `/api/v1/rooms` - Waiting-room listing
/// - `/api/v1/rooms/:id` - Persisted room record (authenticated)
/// - TraceLayer for request logging
/// - Request timeout
pub fn build_routes(
    state: Arc<AppState>,
    health_state: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
    request_timeout: Duration,
) -> Router {
    let public_routes = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/v1/rooms", get(list_rooms))
        .with_state(state.clone());

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics_handle);

    let protected_routes = Router::new()
        .route("/api/v1/rooms/:id", get(get_room))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_participant,
        ))
        .with_state(state);

    public_routes
        .merge(health_router(health_state))
        .merge(metrics_routes)
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade.
///
/// Identity is resolved first so an unauthenticated request gets a 401
/// whether or not it is a well-formed upgrade.
#[instrument(skip_all, name = "rc.routes.ws")]
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<TokenQuery>, QueryRejection>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let query_token = query.ok().and_then(|Query(q)| q.token);

    let participant_id = match state.identity.resolve(&headers, query_token.as_deref()) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    debug!(
        target: "rc.routes",
        participant_id = %participant_id,
        "Upgrading participant connection"
    );

    let actor = ConnectionActor::new(
        participant_id,
        state.registry.clone(),
        state.connection_settings.clone(),
        Arc::clone(&state.metrics),
    );

    ws.on_upgrade(move |socket| serve_socket(actor, socket))
}

async fn serve_socket(actor: ConnectionActor, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let stream = stream.map(|frame| frame.map(WireFrame::from));
    let sink = sink.with(|frame: WireFrame| future::ready(Ok::<Message, axum::Error>(frame.into())));

    actor.run(stream, sink).await;
}

impl From<Message> for WireFrame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => WireFrame::Text(text),
            Message::Binary(data) => WireFrame::Binary(data),
            Message::Ping(data) => WireFrame::Ping(data),
            Message::Pong(data) => WireFrame::Pong(data),
            Message::Close(_) => WireFrame::Close,
        }
    }
}

impl From<WireFrame> for Message {
    fn from(frame: WireFrame) -> Self {
        match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(data) => Message::Binary(data),
            WireFrame::Ping(data) => Message::Ping(data),
            WireFrame::Pong(data) => Message::Pong(data),
            WireFrame::Close => Message::Close(None),
        }
    }
}

async fn list_rooms(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RoomSummary>>, RoomError> {
    Ok(Json(state.registry.list_rooms().await?))
}

/// Persisted record for a room, the existence check for callers that
/// cannot see the registry.
#[instrument(skip_all, name = "rc.routes.get_room", fields(room_id = %id))]
async fn get_room(
    State(state): State<Arc<AppState>>,
    Extension(participant_id): Extension<ParticipantId>,
    Path(id): Path<String>,
) -> Result<Json<RoomRecord>, RoomError> {
    let room_id: RoomId = id
        .parse()
        .map_err(|_| RoomError::RoomNotFound(id.clone()))?;

    debug!(
        target: "rc.routes",
        participant_id = %participant_id,
        room_id = %room_id,
        "Room record lookup"
    );

    state
        .store
        .load(&room_id)
        .await?
        .map(Json)
        .ok_or(RoomError::RoomNotFound(id))
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

/// Authentication middleware for participant endpoints.
///
/// Accepts the Bearer header or the `token` cookie and stores the
/// `ParticipantId` in request extensions.
async fn require_participant(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, RoomError> {
    let participant_id = state.identity.resolve(req.headers(), None)?;
    req.extensions_mut().insert(participant_id);
    Ok(next.run(req).await)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::RegistrySettings;
    use crate::auth::JwtIdentityResolver;
    use crate::observability::metrics::prometheus_builder;
    use crate::protocol::RoomStatus;
    use crate::store::NoopRoomStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use chrono::Utc;
    use common::jwt::issue_participant_token;
    use common::secret::SecretString;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn secret() -> SecretString {
        SecretString::from("test-jwt-secret-0123456789".to_string())
    }

    /// Store holding exactly one record.
    struct SingleRecordStore(RoomRecord);

    #[async_trait]
    impl RoomStore for SingleRecordStore {
        async fn save(&self, _record: &RoomRecord, _ttl: Duration) -> Result<(), RoomError> {
            Ok(())
        }

        async fn load(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, RoomError> {
            Ok((room_id == &self.0.id).then(|| self.0.clone()))
        }

        async fn remove(&self, _room_id: &RoomId) -> Result<(), RoomError> {
            Ok(())
        }
    }

    fn app(store: Arc<dyn RoomStore>) -> (Router, RegistryHandle) {
        let metrics = ActorMetrics::new();
        let registry = RegistryHandle::new(
            Arc::new(NoopRoomStore),
            RegistrySettings::default(),
            Arc::clone(&metrics),
        );
        let state = Arc::new(AppState {
            registry: registry.clone(),
            store,
            identity: Arc::new(JwtIdentityResolver::new(secret())),
            connection_settings: ConnectionSettings::default(),
            metrics,
        });
        let handle = prometheus_builder().unwrap().build_recorder().handle();
        let router = build_routes(
            state,
            Arc::new(HealthState::new()),
            handle,
            Duration::from_secs(5),
        );
        (router, registry)
    }

    fn bearer(sub: &str) -> String {
        format!(
            "Bearer {}",
            issue_participant_token(sub, Duration::from_secs(60), &secret()).unwrap()
        )
    }

    #[tokio::test]
    async fn test_list_rooms_empty() {
        let (router, registry) = app(Arc::new(NoopRoomStore));

        let response = router
            .oneshot(Request::builder().uri("/api/v1/rooms").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"[]");

        registry.cancel();
    }

    #[tokio::test]
    async fn test_ws_without_token_is_unauthorized() {
        let (router, registry) = app(Arc::new(NoopRoomStore));

        let response = router
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("WWW-Authenticate"));
        assert_eq!(registry.get_status().await.unwrap().connected_count, 0);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_ws_with_token_but_no_upgrade_is_rejected() {
        let (router, registry) = app(Arc::new(NoopRoomStore));

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/ws")
                    .header(header::AUTHORIZATION, bearer("alice"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        assert_ne!(response.status(), StatusCode::UNAUTHORIZED);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_get_room_requires_auth() {
        let (router, registry) = app(Arc::new(NoopRoomStore));

        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/rooms/{}", RoomId::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_get_room_returns_record_or_not_found() {
        let record = RoomRecord {
            id: RoomId::new(),
            room_name: Some("pairing".to_string()),
            status: RoomStatus::Waiting,
            created_at: Utc::now(),
            owner_id: ParticipantId::new("alice"),
        };
        let (router, registry) = app(Arc::new(SingleRecordStore(record.clone())));

        let found = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/rooms/{}", record.id))
                    .header(header::AUTHORIZATION, bearer("bob"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        let body = found.into_body().collect().await.unwrap().to_bytes();
        let returned: RoomRecord = serde_json::from_slice(&body).unwrap();
        assert_eq!(returned, record);

        for uri in [
            format!("/api/v1/rooms/{}", RoomId::new()),
            "/api/v1/rooms/not-a-uuid".to_string(),
        ] {
            let missing = router
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(uri)
                        .header(header::AUTHORIZATION, bearer("bob"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        }

        registry.cancel();
    }

    #[tokio::test]
    async fn test_health_and_metrics_are_public() {
        let (router, registry) = app(Arc::new(NoopRoomStore));

        for uri in ["/health", "/metrics"] {
            let response = router
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }

        registry.cancel();
    }

    #[test]
    fn test_wire_frame_message_mapping() {
        assert_eq!(
            WireFrame::from(Message::Text("hi".to_string())),
            WireFrame::Text("hi".to_string())
        );
        assert_eq!(WireFrame::from(Message::Close(None)), WireFrame::Close);
        assert!(matches!(Message::from(WireFrame::Close), Message::Close(None)));
        assert!(matches!(
            Message::from(WireFrame::Ping(vec![1])),
            Message::Ping(data) if data == vec![1]
        ));
    }

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}
