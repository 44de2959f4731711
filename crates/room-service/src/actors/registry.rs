//! `RegistryActor` - singleton owner of the room table.
//!
//! The registry is the top-level actor of the coordinator:
//!
//! - Owns the room table and the table of connected participants
//! - Serializes create, join and depart so lookup-then-act is atomic
//! - Spawns one `RoomActor` per room and removes it the moment it empties
//! - Publishes the waiting-room listing to every connected participant
//! - Owns the root `CancellationToken` for graceful shutdown
//!
//! # Room -> registry traffic
//!
//! The registry awaits rooms for join/leave replies; rooms never await the
//! registry. Rooms report evictions and status changes on an unbounded
//! event channel that the registry drains alongside its mailbox.
//!
//! # Persistence
//!
//! Room records are mirrored to the [`RoomStore`] by a writer task fed
//! through an unbounded channel, so store latency never stalls the
//! registry and writes for one room are applied in order.

use crate::errors::RoomError;
use crate::protocol::{RoomStatus, RoomSummary, RoomsList, ServerEnvelope};
use crate::store::{RoomRecord, RoomStore};

use super::messages::{
    ParticipantLocation, RegistryMessage, RegistryStatus, RoomEvent,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::outbox::ParticipantOutbox;
use super::room::{RoomActor, RoomActorHandle};

use chrono::{DateTime, Utc};
use common::types::{ConnectionId, ParticipantId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long a removed room's task may take to stop before we stop waiting.
const ROOM_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Expiry of persisted room records.
    pub record_ttl: Duration,
    /// Members a room admits, host included.
    pub max_participants: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(crate::config::DEFAULT_ROOM_RECORD_TTL_SECONDS),
            max_participants: crate::config::DEFAULT_MAX_PARTICIPANTS,
        }
    }
}

/// Handle to the `RegistryActor`.
///
/// Cheap to clone; every connection holds one.
#[derive(Clone, Debug)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RegistryHandle {
    /// Spawn the registry actor and return a handle to it.
    #[must_use]
    pub fn new(
        store: Arc<dyn RoomStore>,
        settings: RegistrySettings,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        Self::with_cancel_token(store, settings, metrics, CancellationToken::new())
    }

    /// Spawn the registry under an existing root token.
    #[must_use]
    pub fn with_cancel_token(
        store: Arc<dyn RoomStore>,
        settings: RegistrySettings,
        metrics: Arc<ActorMetrics>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);

        let actor = RegistryActor::new(receiver, cancel_token.clone(), store, settings, metrics);
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Register a connected participant. Supersedes any earlier connection
    /// for the same participant id.
    pub async fn admit(&self, outbox: ParticipantOutbox) -> Result<(), RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Admit {
                outbox,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Create a room hosted by the caller.
    pub async fn create_room(
        &self,
        participant_id: ParticipantId,
        connection_id: ConnectionId,
        room_name: Option<String>,
    ) -> Result<RoomActorHandle, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::CreateRoom {
                participant_id,
                connection_id,
                room_name,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))?
    }

    /// Join a waiting room.
    pub async fn join_room(
        &self,
        participant_id: ParticipantId,
        connection_id: ConnectionId,
        room_id: RoomId,
    ) -> Result<RoomActorHandle, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::JoinRoom {
                participant_id,
                connection_id,
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))?
    }

    /// A connection terminated. Ignored if `connection_id` is not the
    /// participant's current connection.
    pub async fn depart(
        &self,
        participant_id: ParticipantId,
        connection_id: ConnectionId,
    ) -> Result<(), RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Depart {
                participant_id,
                connection_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Snapshot of rooms in `waiting`.
    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::ListRooms { respond_to: tx })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Current connection and room of a participant, if connected.
    pub async fn locate(
        &self,
        participant_id: ParticipantId,
    ) -> Result<Option<ParticipantLocation>, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Locate {
                participant_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the registry and, through child tokens, every room and
    /// connection.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Child token for connection tasks.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Registry-side entry for a live room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    /// Cached from join/leave replies, for listings.
    participant_count: usize,
    /// Cached from status events, for listings.
    status: RoomStatus,
    room_name: String,
    owner_id: ParticipantId,
    created_at: DateTime<Utc>,
}

impl ManagedRoom {
    fn record(&self) -> RoomRecord {
        RoomRecord {
            id: self.handle.room_id(),
            room_name: Some(self.room_name.clone()),
            status: self.status,
            created_at: self.created_at,
            owner_id: self.owner_id.clone(),
        }
    }
}

/// Registry-side entry for an admitted connection.
struct ConnectedParticipant {
    outbox: ParticipantOutbox,
    room: Option<RoomId>,
}

enum StoreOp {
    Save(RoomRecord),
    Remove(RoomId),
}

/// The `RegistryActor` implementation.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    events: mpsc::UnboundedReceiver<RoomEvent>,
    /// Cloned into every room.
    events_tx: mpsc::UnboundedSender<RoomEvent>,
    cancel_token: CancellationToken,
    rooms: HashMap<RoomId, ManagedRoom>,
    participants: HashMap<ParticipantId, ConnectedParticipant>,
    store_ops: mpsc::UnboundedSender<StoreOp>,
    settings: RegistrySettings,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RegistryActor {
    fn new(
        receiver: mpsc::Receiver<RegistryMessage>,
        cancel_token: CancellationToken,
        store: Arc<dyn RoomStore>,
        settings: RegistrySettings,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();

        Self {
            receiver,
            events,
            events_tx,
            cancel_token,
            rooms: HashMap::new(),
            participants: HashMap::new(),
            store_ops: spawn_store_writer(store, settings.record_ttl),
            settings,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
        }
    }

    #[instrument(skip_all, name = "rc.actor.registry")]
    async fn run(mut self) {
        info!(target: "rc.actor.registry", "RegistryActor started");

        loop {
            self.check_room_health().await;

            // Room events are applied before any request queued after them.
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rc.actor.registry",
                        "RegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "rc.actor.registry",
                                "RegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }

            }
        }

        info!(
            target: "rc.actor.registry",
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::Admit { outbox, respond_to } => {
                self.admit(outbox).await;
                let _ = respond_to.send(());
            }

            RegistryMessage::CreateRoom {
                participant_id,
                connection_id,
                room_name,
                respond_to,
            } => {
                let result = self
                    .create_room(&participant_id, connection_id, room_name)
                    .await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::JoinRoom {
                participant_id,
                connection_id,
                room_id,
                respond_to,
            } => {
                let result = self.join_room(&participant_id, connection_id, room_id).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::Depart {
                participant_id,
                connection_id,
                respond_to,
            } => {
                if self.disconnect(&participant_id, connection_id).await {
                    self.publish_rooms_list().await;
                }
                let _ = respond_to.send(());
            }

            RegistryMessage::ListRooms { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(RegistryStatus {
                    room_count: self.rooms.len(),
                    connected_count: self.participants.len(),
                    mailbox_depth: self.mailbox.current_depth(),
                });
            }

            RegistryMessage::Locate {
                participant_id,
                respond_to,
            } => {
                let location = self.participants.get(&participant_id).map(|p| {
                    ParticipantLocation {
                        connection_id: p.outbox.connection_id(),
                        room_id: p.room,
                    }
                });
                let _ = respond_to.send(location);
            }
        }
    }

    async fn handle_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::MemberEvicted {
                room_id,
                participant_id,
                connection_id,
            } => {
                let current = self.participants.get(&participant_id).is_some_and(|p| {
                    p.outbox.connection_id() == connection_id && p.room == Some(room_id)
                });
                if !current {
                    return;
                }

                info!(
                    target: "rc.actor.registry",
                    room_id = %room_id,
                    participant_id = %participant_id,
                    "Removing evicted participant"
                );
                if self.disconnect(&participant_id, connection_id).await {
                    self.publish_rooms_list().await;
                }
            }

            RoomEvent::StatusChanged { room_id, status } => {
                let Some(managed) = self.rooms.get_mut(&room_id) else {
                    return;
                };
                managed.status = status;
                let record = managed.record();
                self.persist(StoreOp::Save(record));
                self.publish_rooms_list().await;
            }
        }
    }

    async fn admit(&mut self, outbox: ParticipantOutbox) {
        let participant_id = outbox.participant_id().clone();
        let connection_id = outbox.connection_id();

        let previous = self.participants.insert(
            participant_id.clone(),
            ConnectedParticipant {
                outbox: outbox.clone(),
                room: None,
            },
        );

        let mut listing_changed = false;
        match previous {
            Some(previous) => {
                info!(
                    target: "rc.actor.registry",
                    participant_id = %participant_id,
                    old_connection_id = %previous.outbox.connection_id(),
                    new_connection_id = %connection_id,
                    "New connection supersedes existing one"
                );
                previous.outbox.close();
                if let Some(room_id) = previous.room {
                    self.leave_room(&participant_id, room_id).await;
                    listing_changed = true;
                }
            }
            None => self.metrics.connection_opened(),
        }

        debug!(
            target: "rc.actor.registry",
            participant_id = %participant_id,
            connection_id = %connection_id,
            connected = self.participants.len(),
            "Participant admitted"
        );

        if listing_changed {
            self.publish_rooms_list().await;
        } else {
            let listing = self.listing_envelope();
            if outbox.deliver(listing).is_err() {
                self.disconnect(&participant_id, connection_id).await;
            }
        }
    }

    async fn create_room(
        &mut self,
        participant_id: &ParticipantId,
        connection_id: ConnectionId,
        room_name: Option<String>,
    ) -> Result<RoomActorHandle, RoomError> {
        let (outbox, current_room) = self.current(participant_id, connection_id)?;

        if let Some(old_room) = current_room {
            self.leave_room(participant_id, old_room).await;
        }

        let room_id = RoomId::new();
        let (handle, task_handle) = RoomActor::spawn(
            room_id,
            outbox,
            self.settings.max_participants,
            self.events_tx.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        let managed = ManagedRoom {
            handle: handle.clone(),
            task_handle,
            participant_count: 1,
            status: RoomStatus::Waiting,
            room_name: room_name.unwrap_or_else(|| format!("room-{}", room_id.short())),
            owner_id: participant_id.clone(),
            created_at: Utc::now(),
        };
        self.persist(StoreOp::Save(managed.record()));
        self.rooms.insert(room_id, managed);
        self.set_room(participant_id, Some(room_id));
        self.metrics.room_created();

        info!(
            target: "rc.actor.registry",
            room_id = %room_id,
            host = %participant_id,
            total_rooms = self.rooms.len(),
            "Room created"
        );

        self.publish_rooms_list().await;
        Ok(handle)
    }

    async fn join_room(
        &mut self,
        participant_id: &ParticipantId,
        connection_id: ConnectionId,
        room_id: RoomId,
    ) -> Result<RoomActorHandle, RoomError> {
        let (outbox, current_room) = self.current(participant_id, connection_id)?;

        let managed = self
            .rooms
            .get(&room_id)
            .ok_or_else(|| RoomError::RoomNotFound(room_id.to_string()))?;
        let handle = managed.handle.clone();

        // Already a member: the room re-sends roomInfo.
        if current_room == Some(room_id) {
            handle.join(outbox).await?;
            return Ok(handle);
        }

        if managed.status != RoomStatus::Waiting {
            return Err(RoomError::RoomUnavailable(room_id.to_string()));
        }

        // Refused here so a full room never costs the caller its current room.
        if managed.participant_count >= self.settings.max_participants {
            return Err(RoomError::RoomUnavailable(room_id.to_string()));
        }

        if let Some(old_room) = current_room {
            self.leave_room(participant_id, old_room).await;
        }

        let result = handle.join(outbox).await;
        match &result {
            Ok(outcome) => {
                if let Some(managed) = self.rooms.get_mut(&room_id) {
                    managed.participant_count = outcome.participant_count;
                }
                self.set_room(participant_id, Some(room_id));

                debug!(
                    target: "rc.actor.registry",
                    room_id = %room_id,
                    participant_id = %participant_id,
                    participant_count = outcome.participant_count,
                    "Participant joined room"
                );
            }
            Err(e) => {
                debug!(
                    target: "rc.actor.registry",
                    room_id = %room_id,
                    participant_id = %participant_id,
                    error = %e,
                    "Room rejected join"
                );
            }
        }

        if result.is_ok() || current_room.is_some() {
            self.publish_rooms_list().await;
        }

        result.map(|_| handle)
    }

    /// The participant's outbox and room, if `connection_id` is current.
    fn current(
        &self,
        participant_id: &ParticipantId,
        connection_id: ConnectionId,
    ) -> Result<(ParticipantOutbox, Option<RoomId>), RoomError> {
        match self.participants.get(participant_id) {
            Some(p) if p.outbox.connection_id() == connection_id => {
                Ok((p.outbox.clone(), p.room))
            }
            _ => Err(RoomError::Unauthorized(
                "Connection is not admitted".to_string(),
            )),
        }
    }

    fn set_room(&mut self, participant_id: &ParticipantId, room: Option<RoomId>) {
        if let Some(p) = self.participants.get_mut(participant_id) {
            p.room = room;
        }
    }

    /// Forget a connection and take it out of its room.
    ///
    /// Returns true if the participant was in a room (the listing changed).
    /// Stale connection ids are ignored.
    async fn disconnect(
        &mut self,
        participant_id: &ParticipantId,
        connection_id: ConnectionId,
    ) -> bool {
        let is_current = self
            .participants
            .get(participant_id)
            .is_some_and(|p| p.outbox.connection_id() == connection_id);
        if !is_current {
            debug!(
                target: "rc.actor.registry",
                participant_id = %participant_id,
                connection_id = %connection_id,
                "Ignoring departure of superseded connection"
            );
            return false;
        }

        let Some(entry) = self.participants.remove(participant_id) else {
            return false;
        };
        entry.outbox.close();
        self.metrics.connection_closed();

        debug!(
            target: "rc.actor.registry",
            participant_id = %participant_id,
            connection_id = %connection_id,
            room_id = ?entry.room,
            "Participant departed"
        );

        match entry.room {
            Some(room_id) => {
                self.leave_room(participant_id, room_id).await;
                true
            }
            None => false,
        }
    }

    /// Remove a member from a room, removing the room if it empties.
    async fn leave_room(&mut self, participant_id: &ParticipantId, room_id: RoomId) {
        let Some(handle) = self.rooms.get(&room_id).map(|m| m.handle.clone()) else {
            return;
        };

        match handle.leave(participant_id.clone()).await {
            Ok(outcome) if outcome.remaining == 0 => {
                self.remove_room(room_id, "empty");
            }
            Ok(outcome) => {
                if let Some(managed) = self.rooms.get_mut(&room_id) {
                    managed.participant_count = outcome.remaining;
                }
            }
            Err(e) => {
                warn!(
                    target: "rc.actor.registry",
                    room_id = %room_id,
                    error = %e,
                    "Room did not answer leave, removing it"
                );
                self.remove_room(room_id, "unresponsive");
            }
        }

        if let Some(p) = self.participants.get_mut(participant_id) {
            if p.room == Some(room_id) {
                p.room = None;
            }
        }
    }

    /// Drop a room from the table.
    ///
    /// Does not wait for the room task; cleanup runs in the background so the
    /// registry loop is never blocked.
    fn remove_room(&mut self, room_id: RoomId, reason: &'static str) {
        let Some(managed) = self.rooms.remove(&room_id) else {
            return;
        };

        managed.handle.cancel();
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_STOP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "rc.actor.registry",
                        room_id = %room_id,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "rc.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "rc.actor.registry",
                        room_id = %room_id,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });

        for p in self.participants.values_mut() {
            if p.room == Some(room_id) {
                p.room = None;
            }
        }

        self.persist(StoreOp::Remove(room_id));
        self.metrics.room_removed();

        info!(
            target: "rc.actor.registry",
            room_id = %room_id,
            reason,
            total_rooms = self.rooms.len(),
            "Room removed"
        );
    }

    fn snapshot(&self) -> Vec<RoomSummary> {
        let mut waiting: Vec<(DateTime<Utc>, RoomSummary)> = self
            .rooms
            .iter()
            .filter(|(_, m)| m.status == RoomStatus::Waiting)
            .map(|(id, m)| {
                (
                    m.created_at,
                    RoomSummary {
                        id: *id,
                        participant_count: m.participant_count,
                        status: m.status,
                    },
                )
            })
            .collect();
        waiting.sort_by_key(|(created_at, _)| *created_at);
        waiting.into_iter().map(|(_, summary)| summary).collect()
    }

    fn listing_envelope(&self) -> ServerEnvelope {
        ServerEnvelope::RoomsList(RoomsList {
            rooms: self.snapshot(),
        })
    }

    /// Send the current listing to every connected participant.
    ///
    /// Participants whose outbox fails are disconnected, which may change the
    /// listing, so this repeats until a pass delivers everywhere.
    async fn publish_rooms_list(&mut self) {
        loop {
            let listing = self.listing_envelope();
            let failed: Vec<(ParticipantId, ConnectionId)> = self
                .participants
                .iter()
                .filter(|(_, p)| p.outbox.deliver(listing.clone()).is_err())
                .map(|(id, p)| (id.clone(), p.outbox.connection_id()))
                .collect();

            if failed.is_empty() {
                break;
            }

            for (participant_id, connection_id) in failed {
                self.metrics.participant_evicted();
                self.disconnect(&participant_id, connection_id).await;
            }
        }
    }

    fn persist(&self, op: StoreOp) {
        if self.store_ops.send(op).is_err() {
            warn!(target: "rc.actor.registry", "Store writer stopped, dropping write");
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "rc.actor.registry",
            room_count = self.rooms.len(),
            connected = self.participants.len(),
            "Performing graceful shutdown"
        );

        for participant in self.participants.values() {
            participant.outbox.close();
        }

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(ROOM_STOP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "rc.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "rc.actor.registry",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(target: "rc.actor.registry", "Graceful shutdown complete");
    }

    /// Remove rooms whose task ended without the registry removing them.
    async fn check_room_health(&mut self) {
        let finished: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, m)| m.task_handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        if finished.is_empty() {
            return;
        }

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    warn!(
                        target: "rc.actor.registry",
                        room_id = %room_id,
                        "Room actor task finished unexpectedly"
                    );
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(
                        target: "rc.actor.registry",
                        room_id = %room_id,
                        error = ?join_error,
                        "Room actor panicked - triggering investigation"
                    );
                    self.metrics.record_panic(ActorType::Room);
                }
                Err(_) => {}
            }

            // Members stay connected, roomless.
            for p in self.participants.values_mut() {
                if p.room == Some(room_id) {
                    p.room = None;
                }
            }
            self.persist(StoreOp::Remove(room_id));
            self.metrics.room_removed();
        }

        self.publish_rooms_list().await;
    }
}

/// Apply store writes in order, off the registry task.
fn spawn_store_writer(store: Arc<dyn RoomStore>, ttl: Duration) -> mpsc::UnboundedSender<StoreOp> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            let result = match &op {
                StoreOp::Save(record) => store.save(record, ttl).await,
                StoreOp::Remove(room_id) => store.remove(room_id).await,
            };
            if let Err(e) = result {
                warn!(
                    target: "rc.actor.registry",
                    error = %e,
                    "Room record write failed"
                );
            }
        }
    });

    tx
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::outbox::{outbox, OutboxReceiver};
    use crate::protocol::{ParticipantNotice, RoomInfo};
    use crate::store::NoopRoomStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Store that remembers the latest record per room.
    #[derive(Default)]
    struct RecordingStore {
        records: Mutex<HashMap<RoomId, RoomRecord>>,
    }

    #[async_trait]
    impl RoomStore for RecordingStore {
        async fn save(&self, record: &RoomRecord, _ttl: Duration) -> Result<(), RoomError> {
            self.records
                .lock()
                .unwrap()
                .insert(record.id, record.clone());
            Ok(())
        }

        async fn load(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, RoomError> {
            Ok(self.records.lock().unwrap().get(room_id).cloned())
        }

        async fn remove(&self, room_id: &RoomId) -> Result<(), RoomError> {
            self.records.lock().unwrap().remove(room_id);
            Ok(())
        }
    }

    struct Client {
        id: ParticipantId,
        conn: ConnectionId,
        rx: OutboxReceiver,
    }

    impl Client {
        fn drain(&mut self) -> Vec<ServerEnvelope> {
            let mut out = Vec::new();
            while let Ok(env) = self.rx.receiver.try_recv() {
                out.push(env);
            }
            out
        }

        /// Queued envelopes other than listings.
        fn drain_events(&mut self) -> Vec<ServerEnvelope> {
            self.drain()
                .into_iter()
                .filter(|e| !matches!(e, ServerEnvelope::RoomsList(_)))
                .collect()
        }
    }

    fn registry() -> RegistryHandle {
        RegistryHandle::new(
            Arc::new(NoopRoomStore),
            RegistrySettings::default(),
            ActorMetrics::new(),
        )
    }

    fn registry_with_limit(max_participants: usize) -> RegistryHandle {
        RegistryHandle::new(
            Arc::new(NoopRoomStore),
            RegistrySettings {
                max_participants,
                ..RegistrySettings::default()
            },
            ActorMetrics::new(),
        )
    }

    async fn connect(registry: &RegistryHandle, id: &str, capacity: usize) -> Client {
        let id = ParticipantId::new(id);
        let conn = ConnectionId::new();
        let (tx, rx) = outbox(id.clone(), conn, capacity);
        registry.admit(tx).await.unwrap();
        Client { id, conn, rx }
    }

    async fn create(registry: &RegistryHandle, client: &Client) -> RoomActorHandle {
        registry
            .create_room(client.id.clone(), client.conn, None)
            .await
            .unwrap()
    }

    async fn join(registry: &RegistryHandle, client: &Client, room_id: RoomId) -> RoomActorHandle {
        registry
            .join_room(client.id.clone(), client.conn, room_id)
            .await
            .unwrap()
    }

    async fn depart(registry: &RegistryHandle, client: &Client) {
        registry
            .depart(client.id.clone(), client.conn)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_admit_sends_current_listing() {
        let registry = registry();
        let host = connect(&registry, "host", 64).await;
        let room = create(&registry, &host).await;

        let mut late = connect(&registry, "late", 64).await;
        let msgs = late.drain();
        assert_eq!(
            msgs,
            vec![ServerEnvelope::RoomsList(RoomsList {
                rooms: vec![RoomSummary {
                    id: room.room_id(),
                    participant_count: 1,
                    status: RoomStatus::Waiting,
                }]
            })]
        );

        registry.cancel();
    }

    #[tokio::test]
    async fn test_create_room_makes_creator_host_and_publishes_listing() {
        let registry = registry();
        let mut host = connect(&registry, "host", 64).await;
        let mut watcher = connect(&registry, "watcher", 64).await;
        host.drain();
        watcher.drain();

        let room = create(&registry, &host).await;
        let room_id = room.room_id();

        assert_eq!(
            host.drain_events(),
            vec![ServerEnvelope::RoomInfo(RoomInfo {
                room_id,
                participant_id: host.id.clone(),
                is_host: true,
            })]
        );
        assert!(watcher.drain().iter().any(|e| matches!(
            e,
            ServerEnvelope::RoomsList(list) if list.rooms.iter().any(|r| r.id == room_id)
        )));

        let location = registry.locate(host.id.clone()).await.unwrap().unwrap();
        assert_eq!(location.room_id, Some(room_id));
        assert_eq!(registry.get_status().await.unwrap().room_count, 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_join_round_trip_and_listing_count() {
        let registry = registry();
        let mut host = connect(&registry, "host", 64).await;
        let mut guest = connect(&registry, "guest", 64).await;
        let room_id = create(&registry, &host).await.room_id();
        host.drain();
        guest.drain();

        join(&registry, &guest, room_id).await;

        assert_eq!(
            guest.drain_events(),
            vec![ServerEnvelope::RoomInfo(RoomInfo {
                room_id,
                participant_id: guest.id.clone(),
                is_host: false,
            })]
        );
        assert_eq!(
            host.drain_events(),
            vec![ServerEnvelope::ParticipantJoined(ParticipantNotice {
                participant_id: guest.id.clone()
            })]
        );

        let rooms = registry.list_rooms().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].participant_count, 2);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_join_unknown_room_is_not_found() {
        let registry = registry();
        let guest = connect(&registry, "guest", 64).await;

        let err = registry
            .join_room(guest.id.clone(), guest.conn, RoomId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::RoomNotFound(_)));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_join_playing_room_is_unavailable() {
        let registry = registry();
        let host = connect(&registry, "host", 64).await;
        let guest = connect(&registry, "guest", 64).await;
        let room = create(&registry, &host).await;

        room.ready(host.id.clone()).await.unwrap();
        assert_eq!(room.get_state().await.unwrap().status, RoomStatus::Playing);

        let err = registry
            .join_room(guest.id.clone(), guest.conn, room.room_id())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::RoomUnavailable(_)));

        // Playing rooms are not listed.
        assert!(registry.list_rooms().await.unwrap().is_empty());
        assert_eq!(registry.get_status().await.unwrap().room_count, 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_host_departure_promotes_remaining_member() {
        let registry = registry();
        let host = connect(&registry, "host", 64).await;
        let mut guest = connect(&registry, "guest", 64).await;
        let room = create(&registry, &host).await;
        join(&registry, &guest, room.room_id()).await;
        guest.drain();

        depart(&registry, &host).await;

        let state = room.get_state().await.unwrap();
        assert_eq!(state.status, RoomStatus::Waiting);
        assert_eq!(state.members.len(), 1);
        assert_eq!(state.host().unwrap().participant_id, guest.id);

        let rooms = registry.list_rooms().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].participant_count, 1);

        assert!(guest
            .drain_events()
            .contains(&ServerEnvelope::ParticipantLeft(ParticipantNotice {
                participant_id: host.id.clone()
            })));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_last_departure_removes_room() {
        let store = Arc::new(RecordingStore::default());
        let registry = RegistryHandle::new(
            Arc::clone(&store) as Arc<dyn RoomStore>,
            RegistrySettings::default(),
            ActorMetrics::new(),
        );
        let host = connect(&registry, "host", 64).await;
        let guest = connect(&registry, "guest", 64).await;
        let room_id = create(&registry, &host).await.room_id();

        depart(&registry, &host).await;

        assert_eq!(registry.get_status().await.unwrap().room_count, 0);
        assert!(registry.list_rooms().await.unwrap().is_empty());
        let err = registry
            .join_room(guest.id.clone(), guest.conn, room_id)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::RoomNotFound(_)));

        // The record written on create is removed again.
        tokio::time::timeout(Duration::from_secs(1), async {
            while store.records.lock().unwrap().contains_key(&room_id) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("room record should be removed");

        registry.cancel();
    }

    #[tokio::test]
    async fn test_create_persists_record_with_default_name() {
        let store = Arc::new(RecordingStore::default());
        let registry = RegistryHandle::new(
            Arc::clone(&store) as Arc<dyn RoomStore>,
            RegistrySettings::default(),
            ActorMetrics::new(),
        );
        let host = connect(&registry, "host", 64).await;
        let room_id = create(&registry, &host).await.room_id();

        let record = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(record) = store.load(&room_id).await.unwrap() {
                    return record;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("room record should be saved");

        assert_eq!(record.owner_id, host.id);
        assert_eq!(record.status, RoomStatus::Waiting);
        assert_eq!(
            record.room_name,
            Some(format!("room-{}", room_id.short()))
        );

        registry.cancel();
    }

    #[tokio::test]
    async fn test_create_while_in_room_leaves_previous_room() {
        let registry = registry();
        let host = connect(&registry, "host", 64).await;
        let first = create(&registry, &host).await.room_id();
        let second = create(&registry, &host).await.room_id();

        assert_ne!(first, second);
        let rooms = registry.list_rooms().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].id, second);

        let location = registry.locate(host.id.clone()).await.unwrap().unwrap();
        assert_eq!(location.room_id, Some(second));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_join_while_in_room_moves_participant() {
        let registry = registry();
        let a = connect(&registry, "a", 64).await;
        let b = connect(&registry, "b", 64).await;
        let c = connect(&registry, "c", 64).await;
        let room_a = create(&registry, &a).await;
        let room_b = create(&registry, &b).await;
        join(&registry, &c, room_a.room_id()).await;

        join(&registry, &c, room_b.room_id()).await;

        assert!(room_a.get_state().await.unwrap().member(&c.id).is_none());
        assert!(room_b.get_state().await.unwrap().member(&c.id).is_some());

        let mut counts: Vec<usize> = registry
            .list_rooms()
            .await
            .unwrap()
            .iter()
            .map(|r| r.participant_count)
            .collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![1, 2]);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_rejoin_same_room_resends_room_info() {
        let registry = registry();
        let mut host = connect(&registry, "host", 64).await;
        let room_id = create(&registry, &host).await.room_id();
        host.drain();

        join(&registry, &host, room_id).await;

        assert_eq!(
            host.drain_events(),
            vec![ServerEnvelope::RoomInfo(RoomInfo {
                room_id,
                participant_id: host.id.clone(),
                is_host: true,
            })]
        );
        assert_eq!(registry.list_rooms().await.unwrap()[0].participant_count, 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_commands_from_unadmitted_connection_are_unauthorized() {
        let registry = registry();
        let host = connect(&registry, "host", 64).await;

        let err = registry
            .create_room(host.id.clone(), ConnectionId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Unauthorized(_)));

        let err = registry
            .create_room(ParticipantId::new("nobody"), ConnectionId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Unauthorized(_)));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_new_connection_supersedes_old_and_stale_depart_is_ignored() {
        let registry = registry();
        let old = connect(&registry, "alice", 64).await;
        let room = create(&registry, &old).await;

        let new = connect(&registry, "alice", 64).await;
        assert!(old.rx.close_token().is_cancelled());

        // Superseding takes the participant out of its room.
        assert!(registry.list_rooms().await.unwrap().is_empty());
        assert!(room.is_cancelled());

        depart(&registry, &old).await;
        let location = registry.locate(new.id.clone()).await.unwrap().unwrap();
        assert_eq!(location.connection_id, new.conn);
        assert_eq!(registry.get_status().await.unwrap().connected_count, 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_evicted_member_is_departed() {
        let metrics = ActorMetrics::new();
        let registry = RegistryHandle::new(
            Arc::new(NoopRoomStore),
            RegistrySettings::default(),
            Arc::clone(&metrics),
        );
        let mut host = connect(&registry, "host", 64).await;
        let room = create(&registry, &host).await;

        // Listing on admit, roomInfo, listing after the join: the queue is full.
        let slow = connect(&registry, "slow", 3).await;
        join(&registry, &slow, room.room_id()).await;
        host.drain();

        room.update(host.id.clone(), "x".to_string()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.locate(slow.id.clone()).await.unwrap().is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("evicted participant should be departed");

        let state = room.get_state().await.unwrap();
        assert_eq!(state.members.len(), 1);
        assert!(host
            .drain_events()
            .contains(&ServerEnvelope::ParticipantLeft(ParticipantNotice {
                participant_id: slow.id.clone()
            })));
        assert!(metrics.eviction_count() >= 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_join_full_room_is_unavailable_and_keeps_current_room() {
        let registry = registry();
        let host = connect(&registry, "host", 64).await;
        let guest = connect(&registry, "guest", 64).await;
        let mut third = connect(&registry, "third", 64).await;
        let full = create(&registry, &host).await;
        join(&registry, &guest, full.room_id()).await;
        let own = create(&registry, &third).await.room_id();
        third.drain();

        let err = registry
            .join_room(third.id.clone(), third.conn, full.room_id())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::RoomUnavailable(_)));

        let location = registry.locate(third.id.clone()).await.unwrap().unwrap();
        assert_eq!(location.room_id, Some(own));
        assert!(full.get_state().await.unwrap().member(&third.id).is_none());
        assert!(third.drain_events().is_empty());

        let mut counts: Vec<(RoomId, usize)> = registry
            .list_rooms()
            .await
            .unwrap()
            .iter()
            .map(|r| (r.id, r.participant_count))
            .collect();
        counts.sort_unstable_by_key(|(_, n)| *n);
        assert_eq!(counts, vec![(own, 1), (full.room_id(), 2)]);

        // Room for one more once the guest leaves.
        depart(&registry, &guest).await;
        join(&registry, &third, full.room_id()).await;
        assert_eq!(full.get_state().await.unwrap().members.len(), 2);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_membership_invariants_hold_after_churn() {
        let registry = registry_with_limit(4);
        let mut clients = Vec::new();
        for i in 0..6 {
            clients.push(connect(&registry, &format!("p{i}"), 256).await);
        }

        let r1 = create(&registry, &clients[0]).await;
        let r2 = create(&registry, &clients[1]).await;
        join(&registry, &clients[2], r1.room_id()).await;
        join(&registry, &clients[3], r1.room_id()).await;
        join(&registry, &clients[4], r2.room_id()).await;
        join(&registry, &clients[5], r2.room_id()).await;
        depart(&registry, &clients[0]).await;
        join(&registry, &clients[3], r2.room_id()).await;
        depart(&registry, &clients[1]).await;

        for client in &clients {
            let Some(location) = registry.locate(client.id.clone()).await.unwrap() else {
                continue;
            };
            if let Some(room_id) = location.room_id {
                let handle = if room_id == r1.room_id() { &r1 } else { &r2 };
                let state = handle.get_state().await.unwrap();
                assert!(state.member(&client.id).is_some());
            }
        }

        for handle in [&r1, &r2] {
            let state = handle.get_state().await.unwrap();
            assert!(!state.members.is_empty());
            assert_eq!(state.members.iter().filter(|m| m.is_host).count(), 1);
        }

        registry.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_membership_invariants_hold_under_concurrent_churn() {
        let registry = registry_with_limit(3);
        let rooms: Arc<Mutex<HashMap<RoomId, RoomActorHandle>>> = Arc::default();

        let mut tasks = Vec::new();
        for i in 0..40usize {
            let registry = registry.clone();
            let rooms = Arc::clone(&rooms);
            tasks.push(tokio::spawn(async move {
                let client = connect(&registry, &format!("p{i}"), 4096).await;

                for step in 0..6usize {
                    if (i + step) % 4 == 0 {
                        if let Ok(handle) =
                            registry.create_room(client.id.clone(), client.conn, None).await
                        {
                            rooms.lock().unwrap().insert(handle.room_id(), handle);
                        }
                    } else {
                        let target = {
                            let rooms = rooms.lock().unwrap();
                            let n = rooms.len().max(1);
                            rooms.keys().nth((i * 7 + step) % n).copied()
                        };
                        if let Some(room_id) = target {
                            // Full, closed and vanished rooms are expected refusals.
                            let _ = registry
                                .join_room(client.id.clone(), client.conn, room_id)
                                .await;
                        }
                    }
                    tokio::task::yield_now().await;
                }

                if i % 3 == 0 {
                    depart(&registry, &client).await;
                    None
                } else {
                    Some(client)
                }
            }));
        }

        let mut clients = Vec::new();
        for task in tasks {
            if let Some(client) = task.await.unwrap() {
                clients.push(client);
            }
        }

        let listed = registry.list_rooms().await.unwrap();
        let rooms = rooms.lock().unwrap().clone();

        // Every listed room is live, non-empty, has exactly one host and
        // matches its listed count.
        for summary in &listed {
            let state = rooms[&summary.id].get_state().await.unwrap();
            assert!(!state.members.is_empty());
            assert!(state.members.len() <= 3);
            assert_eq!(state.members.len(), summary.participant_count);
            assert_eq!(state.members.iter().filter(|m| m.is_host).count(), 1);

            // Members are located in the room on the connection it holds.
            for member in &state.members {
                let location = registry
                    .locate(member.participant_id.clone())
                    .await
                    .unwrap()
                    .expect("room member should be connected");
                assert_eq!(location.room_id, Some(summary.id));
                assert_eq!(location.connection_id, member.connection_id);
            }
        }

        // Every located participant is a member of a listed room.
        for client in &clients {
            let location = registry.locate(client.id.clone()).await.unwrap().unwrap();
            if let Some(room_id) = location.room_id {
                assert!(listed.iter().any(|r| r.id == room_id));
                let state = rooms[&room_id].get_state().await.unwrap();
                assert!(state.member(&client.id).is_some());
            }
        }

        let status = registry.get_status().await.unwrap();
        assert_eq!(status.room_count, listed.len());
        assert_eq!(status.connected_count, clients.len());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_cancel_stops_rooms() {
        let registry = registry();
        let host = connect(&registry, "host", 64).await;
        let room = create(&registry, &host).await;

        registry.cancel();
        assert!(registry.is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), async {
            while room.get_state().await.is_ok() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("room should stop after registry cancellation");

        tokio::time::timeout(Duration::from_secs(1), host.rx.close_token().cancelled_owned())
            .await
            .expect("outboxes should close on shutdown");
    }
}
