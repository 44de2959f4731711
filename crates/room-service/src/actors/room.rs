//! `RoomActor` - per-room state machine and fan-out hub.
//!
//! Each `RoomActor`:
//! - Owns the membership map, status, and per-member ready/host/content
//! - Processes every command for its room on one task, in mailbox order
//! - Fans envelopes out through members' bounded outboxes without waiting
//!
//! # Status
//!
//! `waiting` -> `playing` -> `closed`, or `waiting` -> `closed` if the last
//! member leaves before a start. The actor stops once `closed`.
//!
//! # Membership
//!
//! Members are added and removed only on the registry's request, so the
//! registry can remove an emptied room in the same step that empties it.
//! A member whose outbox fails during fan-out is marked evicted (skipped by
//! further fan-out and ready checks) and reported to the registry, which
//! then removes it through the ordinary leave path.
//!
//! # Host migration
//!
//! When the host leaves, the remaining member with the lowest join
//! sequence becomes host, preferring members that are not pending eviction.

use crate::errors::RoomError;
use crate::observability::metrics as prom;
use crate::protocol::{
    GameStart, ParticipantNotice, RoomInfo, RoomStatus, ServerEnvelope, UpdateNotice,
};

use super::messages::{
    JoinOutcome, LeaveOutcome, MemberInfo, RoomEvent, RoomMessage, RoomState,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::outbox::ParticipantOutbox;

use common::types::{ParticipantId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: RoomId,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Add a member. Registry only.
    pub(crate) async fn join(&self, outbox: ParticipantOutbox) -> Result<JoinOutcome, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Join {
                outbox,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove a member. Registry only.
    pub(crate) async fn leave(
        &self,
        participant_id: ParticipantId,
    ) -> Result<LeaveOutcome, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Leave {
                participant_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Mark a member ready.
    pub async fn ready(&self, participant_id: ParticipantId) -> Result<(), RoomError> {
        self.sender
            .send(RoomMessage::Ready { participant_id })
            .await
            .map_err(|_| RoomError::RoomNotFound(self.room_id.to_string()))
    }

    /// Host-initiated start.
    pub async fn start(&self, participant_id: ParticipantId) -> Result<(), RoomError> {
        self.sender
            .send(RoomMessage::Start { participant_id })
            .await
            .map_err(|_| RoomError::RoomNotFound(self.room_id.to_string()))
    }

    /// Record and fan out a member's editor content.
    pub async fn update(
        &self,
        participant_id: ParticipantId,
        content: String,
    ) -> Result<(), RoomError> {
        self.sender
            .send(RoomMessage::Update {
                participant_id,
                content,
            })
            .await
            .map_err(|_| RoomError::RoomNotFound(self.room_id.to_string()))
    }

    /// Snapshot of the room's state.
    pub async fn get_state(&self) -> Result<RoomState, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| RoomError::RoomNotFound(self.room_id.to_string()))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// One member of a room.
#[derive(Debug)]
struct Member {
    outbox: ParticipantOutbox,
    is_host: bool,
    is_ready: bool,
    /// Latest submitted editor content.
    content: String,
    join_seq: u64,
    /// Outbox failed; awaiting removal by the registry.
    evicted: bool,
}

impl Member {
    fn to_info(&self, participant_id: &ParticipantId) -> MemberInfo {
        MemberInfo {
            participant_id: participant_id.clone(),
            connection_id: self.outbox.connection_id(),
            is_host: self.is_host,
            is_ready: self.is_ready,
            content: self.content.clone(),
            join_seq: self.join_seq,
        }
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: RoomId,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    members: HashMap<ParticipantId, Member>,
    status: RoomStatus,
    /// Membership cap, host included.
    max_participants: usize,
    next_join_seq: u64,
    /// Notifications toward the registry.
    events: mpsc::UnboundedSender<RoomEvent>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a room in `waiting` with `host` as its sole member.
    ///
    /// The host is sent its `roomInfo` before the actor processes any
    /// message, so it always precedes later fan-out to the host.
    pub fn spawn(
        room_id: RoomId,
        host: ParticipantOutbox,
        max_participants: usize,
        events: mpsc::UnboundedSender<RoomEvent>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let mut actor = Self {
            room_id,
            receiver,
            cancel_token: cancel_token.clone(),
            members: HashMap::new(),
            status: RoomStatus::Waiting,
            max_participants,
            next_join_seq: 0,
            events,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, room_id.to_string()),
        };

        let host_id = host.participant_id().clone();
        actor.insert_member(host, true);
        actor.send_room_info(&host_id);

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "rc.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "rc.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if self.status == RoomStatus::Closed {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            status = %self.status,
            members_remaining = self.members.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join { outbox, respond_to } => {
                let result = self.handle_join(outbox);
                let _ = respond_to.send(result);
            }
            RoomMessage::Leave {
                participant_id,
                respond_to,
            } => {
                let outcome = self.handle_leave(&participant_id);
                let _ = respond_to.send(outcome);
            }
            RoomMessage::Ready { participant_id } => self.handle_ready(&participant_id),
            RoomMessage::Start { participant_id } => self.handle_start(&participant_id),
            RoomMessage::Update {
                participant_id,
                content,
            } => self.handle_update(&participant_id, content),
            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }
        }
    }

    fn handle_join(&mut self, outbox: ParticipantOutbox) -> Result<JoinOutcome, RoomError> {
        let participant_id = outbox.participant_id().clone();

        // Re-join of a current member: refresh the outbox and resend roomInfo.
        if let Some(existing) = self.members.get_mut(&participant_id) {
            existing.outbox = outbox;
            existing.evicted = false;
            self.send_room_info(&participant_id);
            return Ok(JoinOutcome {
                participant_count: self.members.len(),
            });
        }

        if self.status != RoomStatus::Waiting {
            return Err(RoomError::RoomUnavailable(self.room_id.to_string()));
        }

        if self.members.len() >= self.max_participants {
            debug!(
                target: "rc.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                max_participants = self.max_participants,
                "Room is full, rejecting join"
            );
            return Err(RoomError::RoomUnavailable(self.room_id.to_string()));
        }

        self.insert_member(outbox, false);
        self.send_room_info(&participant_id);
        self.broadcast(
            &ServerEnvelope::ParticipantJoined(ParticipantNotice {
                participant_id: participant_id.clone(),
            }),
            Some(&participant_id),
        );

        debug!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            members = self.members.len(),
            "Participant joined"
        );

        Ok(JoinOutcome {
            participant_count: self.members.len(),
        })
    }

    fn handle_leave(&mut self, participant_id: &ParticipantId) -> LeaveOutcome {
        let Some(member) = self.members.remove(participant_id) else {
            return LeaveOutcome {
                remaining: self.members.len(),
                promoted: None,
            };
        };

        if self.members.is_empty() {
            self.transition(RoomStatus::Closed);
            return LeaveOutcome {
                remaining: 0,
                promoted: None,
            };
        }

        let promoted = if member.is_host {
            self.promote_host()
        } else {
            None
        };

        self.broadcast(
            &ServerEnvelope::ParticipantLeft(ParticipantNotice {
                participant_id: participant_id.clone(),
            }),
            None,
        );

        if let Some(new_host) = &promoted {
            self.send_room_info(new_host);
        }

        debug!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            remaining = self.members.len(),
            "Participant left"
        );

        LeaveOutcome {
            remaining: self.members.len(),
            promoted,
        }
    }

    fn handle_ready(&mut self, participant_id: &ParticipantId) {
        if self.status != RoomStatus::Waiting {
            debug!(
                target: "rc.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                status = %self.status,
                "Ignoring ready outside waiting"
            );
            return;
        }

        let Some(member) = self.members.get_mut(participant_id) else {
            return;
        };
        member.is_ready = true;

        if self.all_ready() {
            self.begin_game();
        }
    }

    fn handle_start(&mut self, participant_id: &ParticipantId) {
        let Some(member) = self.members.get(participant_id) else {
            return;
        };

        if !member.is_host {
            let err = RoomError::Unauthorized("Only the host can start the game".to_string());
            self.deliver(participant_id, ServerEnvelope::error(err.client_message()));
            return;
        }

        if self.status != RoomStatus::Waiting {
            return;
        }

        if !self.all_ready() {
            // The whole room is told why the start did not happen.
            self.broadcast(
                &ServerEnvelope::error(RoomError::NotAllReady.client_message()),
                None,
            );
            return;
        }

        self.begin_game();
    }

    fn handle_update(&mut self, participant_id: &ParticipantId, content: String) {
        let Some(member) = self.members.get_mut(participant_id) else {
            return;
        };
        member.content.clone_from(&content);

        self.broadcast(
            &ServerEnvelope::Update(UpdateNotice {
                participant_id: participant_id.clone(),
                content,
            }),
            None,
        );
    }

    fn state(&self) -> RoomState {
        let mut members: Vec<MemberInfo> = self
            .members
            .iter()
            .map(|(id, m)| m.to_info(id))
            .collect();
        members.sort_by_key(|m| m.join_seq);

        RoomState {
            room_id: self.room_id,
            status: self.status,
            members,
        }
    }

    fn insert_member(&mut self, outbox: ParticipantOutbox, is_host: bool) {
        let participant_id = outbox.participant_id().clone();
        let join_seq = self.next_join_seq;
        self.next_join_seq += 1;

        self.members.insert(
            participant_id,
            Member {
                outbox,
                is_host,
                is_ready: false,
                content: String::new(),
                join_seq,
                evicted: false,
            },
        );
    }

    fn promote_host(&mut self) -> Option<ParticipantId> {
        let new_host = self
            .members
            .iter()
            .min_by_key(|(_, m)| (m.evicted, m.join_seq))
            .map(|(id, _)| id.clone())?;

        if let Some(member) = self.members.get_mut(&new_host) {
            member.is_host = true;
        }
        prom::record_host_migration();

        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            new_host = %new_host,
            "Host migrated"
        );

        Some(new_host)
    }

    /// True when at least one live member exists and every live member is ready.
    fn all_ready(&self) -> bool {
        let mut live = self.members.values().filter(|m| !m.evicted).peekable();
        live.peek().is_some() && live.all(|m| m.is_ready)
    }

    fn begin_game(&mut self) {
        self.transition(RoomStatus::Playing);
        self.broadcast(
            &ServerEnvelope::GameStart(GameStart {
                room_id: self.room_id,
            }),
            None,
        );
    }

    fn transition(&mut self, status: RoomStatus) {
        if self.status == status {
            return;
        }

        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            from = %self.status,
            to = %status,
            "Room status changed"
        );

        self.status = status;
        prom::record_room_transition(status.as_str());

        // Closure is reported through the leave reply instead.
        if status != RoomStatus::Closed {
            let _ = self.events.send(RoomEvent::StatusChanged {
                room_id: self.room_id,
                status,
            });
        }
    }

    fn send_room_info(&mut self, participant_id: &ParticipantId) {
        let Some(member) = self.members.get(participant_id) else {
            return;
        };
        let info = ServerEnvelope::RoomInfo(RoomInfo {
            room_id: self.room_id,
            participant_id: participant_id.clone(),
            is_host: member.is_host,
        });
        self.deliver(participant_id, info);
    }

    fn deliver(&mut self, participant_id: &ParticipantId, envelope: ServerEnvelope) {
        let failed = match self.members.get(participant_id) {
            Some(member) if !member.evicted => member.outbox.deliver(envelope).is_err(),
            _ => false,
        };

        if failed {
            self.evict(participant_id);
        }
    }

    fn broadcast(&mut self, envelope: &ServerEnvelope, except: Option<&ParticipantId>) {
        let failed: Vec<ParticipantId> = self
            .members
            .iter()
            .filter(|(id, m)| !m.evicted && Some(*id) != except)
            .filter(|(_, m)| m.outbox.deliver(envelope.clone()).is_err())
            .map(|(id, _)| id.clone())
            .collect();

        for participant_id in failed {
            self.evict(&participant_id);
        }
    }

    fn evict(&mut self, participant_id: &ParticipantId) {
        let Some(member) = self.members.get_mut(participant_id) else {
            return;
        };
        if member.evicted {
            return;
        }

        member.evicted = true;
        member.outbox.close();
        self.metrics.participant_evicted();

        warn!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            "Outbound queue full or closed, evicting participant"
        );

        let _ = self.events.send(RoomEvent::MemberEvicted {
            room_id: self.room_id,
            participant_id: participant_id.clone(),
            connection_id: member.outbox.connection_id(),
        });
    }
}
