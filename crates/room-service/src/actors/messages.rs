//! Message types for actor communication.
//!
//! Request/reply messages carry a `respond_to` oneshot sender; commands that
//! only fan out (ready, start, update) are fire-and-forget.

use crate::errors::RoomError;
use crate::protocol::{RoomStatus, RoomSummary};

use super::outbox::ParticipantOutbox;
use super::room::RoomActorHandle;

use common::types::{ConnectionId, ParticipantId, RoomId};
use tokio::sync::oneshot;

// ============================================================================
// Registry messages
// ============================================================================

/// Messages handled by the `RegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Register a newly connected participant for command routing.
    Admit {
        outbox: ParticipantOutbox,
        respond_to: oneshot::Sender<()>,
    },

    /// Create a room with the requester as host.
    CreateRoom {
        participant_id: ParticipantId,
        connection_id: ConnectionId,
        room_name: Option<String>,
        respond_to: oneshot::Sender<Result<RoomActorHandle, RoomError>>,
    },

    /// Join an existing waiting room.
    JoinRoom {
        participant_id: ParticipantId,
        connection_id: ConnectionId,
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<RoomActorHandle, RoomError>>,
    },

    /// A connection terminated.
    Depart {
        participant_id: ParticipantId,
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<()>,
    },

    /// Snapshot of waiting rooms.
    ListRooms {
        respond_to: oneshot::Sender<Vec<RoomSummary>>,
    },

    /// Registry status (for observability and tests).
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Where a participant currently is (for tests and diagnostics).
    Locate {
        participant_id: ParticipantId,
        respond_to: oneshot::Sender<Option<ParticipantLocation>>,
    },
}

/// Registry status snapshot.
#[derive(Debug, Clone)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub connected_count: usize,
    pub mailbox_depth: usize,
}

/// A connected participant's registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantLocation {
    pub connection_id: ConnectionId,
    pub room_id: Option<RoomId>,
}

/// Notifications a room raises toward the registry.
///
/// Sent over an unbounded channel so a room never waits on the registry;
/// the registry, in turn, awaits rooms for join/leave replies.
#[derive(Debug)]
pub enum RoomEvent {
    /// A member's outbound queue was full or closed during fan-out.
    MemberEvicted {
        room_id: RoomId,
        participant_id: ParticipantId,
        connection_id: ConnectionId,
    },

    /// The room left `waiting`.
    StatusChanged { room_id: RoomId, status: RoomStatus },
}

// ============================================================================
// Room messages
// ============================================================================

/// Messages handled by a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// Add a member. Only the registry sends this.
    Join {
        outbox: ParticipantOutbox,
        respond_to: oneshot::Sender<Result<JoinOutcome, RoomError>>,
    },

    /// Remove a member. Only the registry sends this.
    Leave {
        participant_id: ParticipantId,
        respond_to: oneshot::Sender<LeaveOutcome>,
    },

    Ready {
        participant_id: ParticipantId,
    },

    Start {
        participant_id: ParticipantId,
    },

    Update {
        participant_id: ParticipantId,
        content: String,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

/// Result of a successful join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub participant_count: usize,
}

/// Result of a leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Members remaining after the leave. Zero means the room closed.
    pub remaining: usize,
    /// New host, if the leaving member was host.
    pub promoted: Option<ParticipantId>,
}

/// Member view returned by `GetState`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub participant_id: ParticipantId,
    pub connection_id: ConnectionId,
    pub is_host: bool,
    pub is_ready: bool,
    pub content: String,
    pub join_seq: u64,
}

/// Room state snapshot.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: RoomId,
    pub status: RoomStatus,
    pub members: Vec<MemberInfo>,
}

impl RoomState {
    #[must_use]
    pub fn member(&self, participant_id: &ParticipantId) -> Option<&MemberInfo> {
        self.members
            .iter()
            .find(|m| &m.participant_id == participant_id)
    }

    #[must_use]
    pub fn host(&self) -> Option<&MemberInfo> {
        self.members.iter().find(|m| m.is_host)
    }
}
