//! Per-participant bounded outbound queue.
//!
//! The queue decouples room fan-out from the speed of one participant's
//! network writes. Producers (the registry and the participant's room) hold
//! cloned [`ParticipantOutbox`] handles; the connection's outbound loop
//! owns the [`OutboxReceiver`].
//!
//! Delivery never waits. A full or closed queue closes the outbox: the
//! shared `CancellationToken` is cancelled, which the outbound loop
//! observes as "send a close frame and stop", and the inbound loop observes
//! as "stop reading and depart".

use crate::errors::RoomError;
use crate::protocol::ServerEnvelope;

use common::types::{ConnectionId, ParticipantId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Producer side of a participant's outbound queue.
#[derive(Clone, Debug)]
pub struct ParticipantOutbox {
    participant_id: ParticipantId,
    connection_id: ConnectionId,
    sender: mpsc::Sender<ServerEnvelope>,
    closed: CancellationToken,
}

/// Consumer side of a participant's outbound queue.
#[derive(Debug)]
pub struct OutboxReceiver {
    pub(crate) receiver: mpsc::Receiver<ServerEnvelope>,
    closed: CancellationToken,
}

/// Create a bounded outbox for one connection.
#[must_use]
pub fn outbox(
    participant_id: ParticipantId,
    connection_id: ConnectionId,
    capacity: usize,
) -> (ParticipantOutbox, OutboxReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let closed = CancellationToken::new();

    (
        ParticipantOutbox {
            participant_id,
            connection_id,
            sender,
            closed: closed.clone(),
        },
        OutboxReceiver { receiver, closed },
    )
}

impl ParticipantOutbox {
    #[must_use]
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Enqueue an envelope without waiting.
    ///
    /// # Errors
    ///
    /// Returns `RoomError::DeliveryFailed` if the queue is full or already
    /// closed. In both cases the outbox is closed before returning.
    pub fn deliver(&self, envelope: ServerEnvelope) -> Result<(), RoomError> {
        if self.is_closed() {
            return Err(RoomError::DeliveryFailed(self.participant_id.to_string()));
        }

        match self.sender.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => {
                debug!(
                    target: "rc.actor.connection",
                    participant_id = %self.participant_id,
                    connection_id = %self.connection_id,
                    envelope = dropped.kind(),
                    "Outbound queue full, closing outbox"
                );
                self.close();
                Err(RoomError::DeliveryFailed(self.participant_id.to_string()))
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                Err(RoomError::DeliveryFailed(self.participant_id.to_string()))
            }
        }
    }

    /// Close the outbox. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl OutboxReceiver {
    /// Token cancelled when the outbox is closed from either side.
    #[must_use]
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Number of envelopes waiting to be written.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    /// Next queued envelope, or `None` once the outbox is closed or every
    /// producer is gone.
    pub async fn recv(&mut self) -> Option<ServerEnvelope> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            msg = self.receiver.recv() => msg,
        }
    }
}
