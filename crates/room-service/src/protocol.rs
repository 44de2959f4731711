//! Wire envelopes exchanged between participants and the coordinator.
//!
//! Every frame is a UTF-8 JSON object `{"type": <tag>, "payload": <object>}`.
//! Client frames are decoded once, at the edge, into the closed
//! [`ClientEnvelope`] union; nothing downstream inspects raw JSON.
//!
//! Server frames are the [`ServerEnvelope`] union, serialized with the same
//! adjacently tagged layout.

use common::types::{ParticipantId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Lifecycle status of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Playing,
    Closed,
}

impl RoomStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Waiting => "waiting",
            RoomStatus::Playing => "playing",
            RoomStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discovery entry for one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: RoomId,
    pub participant_count: usize,
    pub status: RoomStatus,
}

// ============================================================================
// Client -> server
// ============================================================================

/// Decoded client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEnvelope {
    CreateRoom(CreateRoomPayload),
    JoinRoom(JoinRoomPayload),
    Ready,
    Start,
    Update(UpdatePayload),
}

impl ClientEnvelope {
    /// Wire tag, used as a bounded metric label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ClientEnvelope::CreateRoom(_) => "createRoom",
            ClientEnvelope::JoinRoom(_) => "joinRoom",
            ClientEnvelope::Ready => "ready",
            ClientEnvelope::Start => "start",
            ClientEnvelope::Update(_) => "update",
        }
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` when the frame is not JSON, the tag is
    /// unknown, or the payload does not match the tag's schema.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        match raw.kind.as_str() {
            "createRoom" => {
                // Payload is optional for createRoom.
                if raw.payload.is_null() {
                    Ok(ClientEnvelope::CreateRoom(CreateRoomPayload::default()))
                } else {
                    payload("createRoom", raw.payload).map(ClientEnvelope::CreateRoom)
                }
            }
            "joinRoom" => payload("joinRoom", raw.payload).map(ClientEnvelope::JoinRoom),
            "ready" => Ok(ClientEnvelope::Ready),
            "start" => Ok(ClientEnvelope::Start),
            "update" => payload("update", raw.payload).map(ClientEnvelope::Update),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    value: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomPayload {
    #[serde(default)]
    pub room_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    /// Kept as sent; an id that does not parse names no room.
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    /// Optional claimed origin; must match the authenticated sender if set.
    #[serde(default)]
    pub participant_id: Option<ParticipantId>,
    pub content: String,
}

/// Client frame decode failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

// ============================================================================
// Server -> client
// ============================================================================

/// Server-originated envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ServerEnvelope {
    RoomInfo(RoomInfo),
    RoomsList(RoomsList),
    ParticipantJoined(ParticipantNotice),
    ParticipantLeft(ParticipantNotice),
    GameStart(GameStart),
    Update(UpdateNotice),
    Error(ErrorNotice),
}

impl ServerEnvelope {
    /// Wire tag, used for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ServerEnvelope::RoomInfo(_) => "roomInfo",
            ServerEnvelope::RoomsList(_) => "roomsList",
            ServerEnvelope::ParticipantJoined(_) => "participantJoined",
            ServerEnvelope::ParticipantLeft(_) => "participantLeft",
            ServerEnvelope::GameStart(_) => "gameStart",
            ServerEnvelope::Update(_) => "update",
            ServerEnvelope::Error(_) => "error",
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerEnvelope::Error(ErrorNotice {
            message: message.into(),
        })
    }

    /// Encode as a text frame.
    ///
    /// # Errors
    ///
    /// Propagates `serde_json` serialization errors.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub participant_id: ParticipantId,
    pub is_host: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomsList {
    pub rooms: Vec<RoomSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantNotice {
    pub participant_id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStart {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNotice {
    pub participant_id: ParticipantId,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
}
