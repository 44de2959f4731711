//! Room coordinator error types.
//!
//! Errors reach clients two ways: as an `error` envelope on the WebSocket,
//! or as a JSON body on the HTTP surface. Both use `client_message()`, so
//! internal details are logged server-side but never sent.

use crate::protocol::ProtocolError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Room coordinator error type.
///
/// Error codes:
/// - `MalformedPayload`: `BAD_REQUEST` (1)
/// - `Unauthorized`: `UNAUTHORIZED` (2)
/// - `RoomNotFound`: `NOT_FOUND` (4)
/// - `RoomUnavailable`: `CONFLICT` (5)
/// - `DeliveryFailed`, `Store`, `Internal`: `INTERNAL_ERROR` (6)
/// - `NotAllReady`: `PRECONDITION_FAILED` (8)
#[derive(Debug, Error)]
pub enum RoomError {
    /// Join or command references a room that is not in the registry.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Join targets a room that is no longer waiting.
    #[error("Room unavailable: {0}")]
    RoomUnavailable(String),

    /// Start requested before every member was ready.
    #[error("Not all participants are ready")]
    NotAllReady,

    /// Non-host start, spoofed update origin, or missing identity.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Envelope decode or required-field extraction failure.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A participant's outbound queue is full or closed.
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// Metadata store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Internal error (actor channel closed, serialization, ...).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoomError {
    /// Returns the numeric error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            RoomError::MalformedPayload(_) => 1,
            RoomError::Unauthorized(_) => 2,
            RoomError::RoomNotFound(_) => 4,
            RoomError::RoomUnavailable(_) => 5,
            RoomError::DeliveryFailed(_) | RoomError::Store(_) | RoomError::Internal(_) => 6,
            RoomError::NotAllReady => 8,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RoomError::RoomNotFound(_) => "Room not found".to_string(),
            RoomError::RoomUnavailable(_) => "Room is not available".to_string(),
            RoomError::NotAllReady => "Not all players are ready".to_string(),
            RoomError::Unauthorized(msg) => msg.clone(),
            RoomError::MalformedPayload(_) => "Malformed message".to_string(),
            RoomError::DeliveryFailed(_) | RoomError::Store(_) | RoomError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            RoomError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            RoomError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RoomError::RoomNotFound(_) => StatusCode::NOT_FOUND,
            RoomError::RoomUnavailable(_) => StatusCode::CONFLICT,
            RoomError::NotAllReady => StatusCode::PRECONDITION_FAILED,
            RoomError::DeliveryFailed(_) | RoomError::Store(_) | RoomError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code_name(&self) -> &'static str {
        match self {
            RoomError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            RoomError::RoomUnavailable(_) => "ROOM_UNAVAILABLE",
            RoomError::NotAllReady => "NOT_ALL_READY",
            RoomError::Unauthorized(_) => "UNAUTHORIZED",
            RoomError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            RoomError::DeliveryFailed(_) | RoomError::Store(_) | RoomError::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }
}

impl From<ProtocolError> for RoomError {
    fn from(err: ProtocolError) -> Self {
        RoomError::MalformedPayload(err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for RoomError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(target: "rc.errors", error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code_name().to_string(),
                message: self.client_message(),
            },
        };

        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            if let Ok(header_value) = "Bearer realm=\"code-room\", error=\"invalid_token\"".parse()
            {
                response
                    .headers_mut()
                    .insert("WWW-Authenticate", header_value);
            }
        }

        response
    }
}
