//! `ConnectionActor` - one participant's WebSocket session.
//!
//! Each connection runs two cooperating loops joined by the participant's
//! bounded outbox:
//!
//! - **Inbound** (on the calling task): reads frames, decodes client
//!   envelopes and dispatches them to the registry or the current room.
//! - **Outbound** (spawned): drains the outbox into the socket and sends
//!   transport pings.
//!
//! The outbox close token is the shared done-signal. The inbound loop stops
//! when it fires (eviction, supersede, shutdown), and the outbound loop
//! answers it with a close frame. When the inbound loop ends for any reason
//! the participant departs and the outbox is closed, which stops the
//! outbound loop.
//!
//! The actor is generic over the transport so it can be driven by axum's
//! WebSocket in production and by in-memory channels in tests.

use crate::config::Config;
use crate::errors::RoomError;
use crate::observability::metrics as prom;
use crate::protocol::{ClientEnvelope, ServerEnvelope};

use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::outbox::{outbox, OutboxReceiver, ParticipantOutbox};
use super::registry::RegistryHandle;
use super::room::RoomActorHandle;

use common::types::{ConnectionId, ParticipantId, RoomId};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Transport frame, independent of the WebSocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Outbox bound.
    pub queue_capacity: usize,
    /// Transport ping cadence.
    pub ping_interval: Duration,
    /// Inbound silence after which the connection is dropped.
    pub idle_timeout: Duration,
}

impl ConnectionSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue_capacity: config.outbound_queue_capacity,
            ping_interval: config.ping_interval(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: crate::config::DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            ping_interval: Duration::from_secs(crate::config::DEFAULT_PING_INTERVAL_SECONDS),
            idle_timeout: Duration::from_secs(crate::config::DEFAULT_IDLE_TIMEOUT_SECONDS),
        }
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    participant_id: ParticipantId,
    connection_id: ConnectionId,
    registry: RegistryHandle,
    settings: ConnectionSettings,
    /// Child of the registry's root token.
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
}

impl ConnectionActor {
    /// Create an actor for an authenticated participant.
    #[must_use]
    pub fn new(
        participant_id: ParticipantId,
        registry: RegistryHandle,
        settings: ConnectionSettings,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let cancel_token = registry.child_token();
        Self {
            participant_id,
            connection_id: ConnectionId::new(),
            registry,
            settings,
            cancel_token,
            metrics,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Run the session until the peer goes away or the participant is
    /// removed. Departs from the registry before returning.
    #[instrument(
        skip_all,
        name = "rc.actor.connection",
        fields(
            participant_id = %self.participant_id,
            connection_id = %self.connection_id
        )
    )]
    pub async fn run<S, K, E>(self, stream: S, sink: K)
    where
        S: Stream<Item = Result<WireFrame, E>> + Send,
        E: fmt::Display + Send,
        K: Sink<WireFrame> + Send + 'static,
        K::Error: fmt::Display + Send,
    {
        let (outbox, receiver) = outbox(
            self.participant_id.clone(),
            self.connection_id,
            self.settings.queue_capacity,
        );
        let close = receiver.close_token();

        if let Err(e) = self.registry.admit(outbox.clone()).await {
            warn!(
                target: "rc.actor.connection",
                error = %e,
                "Registry unavailable, dropping connection"
            );
            return;
        }

        info!(
            target: "rc.actor.connection",
            participant_id = %self.participant_id,
            connection_id = %self.connection_id,
            "Connection admitted"
        );

        let writer = tokio::spawn(write_loop(
            sink,
            receiver,
            self.settings.ping_interval,
            self.cancel_token.clone(),
            self.connection_id,
        ));

        let reason = self.read_loop(stream, &outbox, &close).await;

        if let Err(e) = self
            .registry
            .depart(self.participant_id.clone(), self.connection_id)
            .await
        {
            debug!(
                target: "rc.actor.connection",
                error = %e,
                "Depart not delivered"
            );
        }
        outbox.close();

        if let Err(e) = writer.await {
            if e.is_panic() {
                error!(
                    target: "rc.actor.connection",
                    error = ?e,
                    "Outbound loop panicked"
                );
                self.metrics.record_panic(ActorType::Connection);
            }
        }

        info!(
            target: "rc.actor.connection",
            participant_id = %self.participant_id,
            connection_id = %self.connection_id,
            reason,
            "Connection closed"
        );
    }

    /// Returns why the loop stopped.
    async fn read_loop<S, E>(
        &self,
        stream: S,
        outbox: &ParticipantOutbox,
        close: &CancellationToken,
    ) -> &'static str
    where
        S: Stream<Item = Result<WireFrame, E>>,
        E: fmt::Display,
    {
        let mut stream = pin!(stream);
        let mut room: Option<RoomActorHandle> = None;

        loop {
            let frame = tokio::select! {
                biased;

                () = close.cancelled() => return "outbox closed",
                () = self.cancel_token.cancelled() => return "shutdown",

                next = tokio::time::timeout(self.settings.idle_timeout, stream.next()) => {
                    match next {
                        Err(_) => {
                            info!(
                                target: "rc.actor.connection",
                                participant_id = %self.participant_id,
                                idle_timeout_secs = self.settings.idle_timeout.as_secs(),
                                "Connection idle, dropping"
                            );
                            return "idle timeout";
                        }
                        Ok(None) => return "stream ended",
                        Ok(Some(Err(e))) => {
                            debug!(
                                target: "rc.actor.connection",
                                error = %e,
                                "Read failed"
                            );
                            return "read error";
                        }
                        Ok(Some(Ok(frame))) => frame,
                    }
                }
            };

            match frame {
                WireFrame::Text(text) => {
                    if let Err(e) = self.dispatch(&text, &mut room).await {
                        self.report(outbox, &e);
                    }
                }
                WireFrame::Close => return "peer closed",
                WireFrame::Binary(_) | WireFrame::Ping(_) | WireFrame::Pong(_) => {}
            }
        }
    }

    async fn dispatch(
        &self,
        text: &str,
        room: &mut Option<RoomActorHandle>,
    ) -> Result<(), RoomError> {
        let envelope = match ClientEnvelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Dropped without a reply; the connection stays open.
                prom::record_malformed_message();
                warn!(
                    target: "rc.actor.connection",
                    participant_id = %self.participant_id,
                    error = %e,
                    "Dropping malformed message"
                );
                return Ok(());
            }
        };
        prom::record_message_received(envelope.kind());

        let participant_id = self.participant_id.clone();
        match envelope {
            ClientEnvelope::CreateRoom(payload) => {
                let handle = self
                    .registry
                    .create_room(participant_id, self.connection_id, payload.room_name)
                    .await?;
                *room = Some(handle);
                Ok(())
            }
            ClientEnvelope::JoinRoom(payload) => {
                let room_id: RoomId = payload
                    .room_id
                    .parse()
                    .map_err(|_| RoomError::RoomNotFound(payload.room_id.clone()))?;

                match self
                    .registry
                    .join_room(participant_id, self.connection_id, room_id)
                    .await
                {
                    Ok(handle) => {
                        *room = Some(handle);
                        Ok(())
                    }
                    Err(e) => {
                        if room.is_some() {
                            self.resync_room(room).await;
                        }
                        Err(e)
                    }
                }
            }
            ClientEnvelope::Ready => current(room.as_ref())?.ready(participant_id).await,
            ClientEnvelope::Start => current(room.as_ref())?.start(participant_id).await,
            ClientEnvelope::Update(payload) => {
                if payload
                    .participant_id
                    .as_ref()
                    .is_some_and(|claimed| claimed != &participant_id)
                {
                    return Err(RoomError::Unauthorized(
                        "Cannot update another participant".to_string(),
                    ));
                }
                current(room.as_ref())?
                    .update(participant_id, payload.content)
                    .await
            }
        }
    }

    /// Re-read membership after a failed join.
    ///
    /// A join can fail after the registry already took the participant out
    /// of its previous room, so the cached handle is only kept while the
    /// registry still places this connection in that room.
    async fn resync_room(&self, room: &mut Option<RoomActorHandle>) {
        let still_member = match self.registry.locate(self.participant_id.clone()).await {
            Ok(Some(location)) => {
                location.connection_id == self.connection_id
                    && location.room_id == room.as_ref().map(RoomActorHandle::room_id)
            }
            Ok(None) | Err(_) => false,
        };

        if !still_member {
            debug!(
                target: "rc.actor.connection",
                participant_id = %self.participant_id,
                "Dropping stale room handle after failed join"
            );
            *room = None;
        }
    }

    /// Send an error envelope to this participant only.
    fn report(&self, outbox: &ParticipantOutbox, err: &RoomError) {
        debug!(
            target: "rc.actor.connection",
            participant_id = %self.participant_id,
            error = %err,
            "Command rejected"
        );
        // A failed delivery closes the outbox, which ends the read loop.
        let _ = outbox.deliver(ServerEnvelope::error(err.client_message()));
    }
}

fn current(room: Option<&RoomActorHandle>) -> Result<&RoomActorHandle, RoomError> {
    room.ok_or_else(|| RoomError::RoomNotFound("participant is not in a room".to_string()))
}

async fn write_loop<K>(
    sink: K,
    mut receiver: OutboxReceiver,
    ping_interval: Duration,
    shutdown: CancellationToken,
    connection_id: ConnectionId,
) where
    K: Sink<WireFrame>,
    K::Error: fmt::Display,
{
    let mut sink = pin!(sink);
    let close = receiver.close_token();
    let mailbox = MailboxMonitor::new(ActorType::Connection, connection_id.to_string());

    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            () = close.cancelled() => {
                let _ = sink.send(WireFrame::Close).await;
                break;
            }

            () = shutdown.cancelled() => {
                let _ = sink.send(WireFrame::Close).await;
                close.cancel();
                break;
            }

            msg = receiver.recv() => {
                // `None` once closed or every producer is gone.
                let Some(envelope) = msg else {
                    break;
                };
                mailbox.record_depth(receiver.queued());

                let text = match envelope.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(
                            target: "rc.actor.connection",
                            envelope = envelope.kind(),
                            error = %e,
                            "Failed to encode envelope"
                        );
                        mailbox.record_drop();
                        continue;
                    }
                };

                if let Err(e) = sink.send(WireFrame::Text(text)).await {
                    debug!(
                        target: "rc.actor.connection",
                        connection_id = %connection_id,
                        error = %e,
                        "Write failed"
                    );
                    close.cancel();
                    break;
                }
                mailbox.record_dequeue();
            }

            _ = ping.tick() => {
                if sink.send(WireFrame::Ping(Vec::new())).await.is_err() {
                    close.cancel();
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;

    debug!(
        target: "rc.actor.connection",
        connection_id = %connection_id,
        messages_written = mailbox.messages_processed(),
        "Outbound loop stopped"
    );
}
