//! WebSocket test client.
//!
//! Speaks the coordinator's JSON envelope protocol over a real socket.
//! Every receive is bounded by [`RECV_TIMEOUT`] so a missing message fails
//! the test instead of hanging it.

use crate::server_harness::TestRoomServer;
use anyhow::{anyhow, bail};
use common::types::ParticipantId;
use futures_util::{SinkExt, StreamExt};
use room_service::protocol::{RoomInfo, RoomsList, ServerEnvelope};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Upper bound on any single receive.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A connected participant.
pub struct TestClient {
    participant_id: ParticipantId,
    socket: WsStream,
}

impl TestClient {
    /// Connect as `participant_id`, passing the token as a query parameter.
    pub async fn connect(server: &TestRoomServer, participant_id: &str) -> anyhow::Result<Self> {
        let url = format!(
            "{}?token={}",
            server.ws_url(),
            server.token_for(participant_id)
        );
        let (socket, _response) = connect_async(url).await?;

        Ok(Self {
            participant_id: ParticipantId::new(participant_id),
            socket,
        })
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub async fn send_json(&mut self, value: Value) -> anyhow::Result<()> {
        self.send_text(value.to_string()).await
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> anyhow::Result<()> {
        self.socket.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Next server envelope, ignoring transport frames.
    pub async fn recv(&mut self) -> anyhow::Result<ServerEnvelope> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.socket.next())
                .await
                .map_err(|_| anyhow!("{}: timed out waiting for a message", self.participant_id))?
                .ok_or_else(|| anyhow!("{}: connection closed", self.participant_id))??;

            match frame {
                Message::Text(text) => return Ok(serde_json::from_str(&text)?),
                Message::Close(_) => bail!("{}: connection closed by server", self.participant_id),
                _ => {}
            }
        }
    }

    /// Next envelope that is not a `roomsList` broadcast.
    pub async fn recv_skipping_lists(&mut self) -> anyhow::Result<ServerEnvelope> {
        loop {
            match self.recv().await? {
                ServerEnvelope::RoomsList(_) => {}
                other => return Ok(other),
            }
        }
    }

    pub async fn recv_room_info(&mut self) -> anyhow::Result<RoomInfo> {
        match self.recv_skipping_lists().await? {
            ServerEnvelope::RoomInfo(info) => Ok(info),
            other => bail!("{}: expected roomInfo, got {other:?}", self.participant_id),
        }
    }

    /// Next `roomsList`, discarding anything before it.
    pub async fn recv_rooms_list(&mut self) -> anyhow::Result<RoomsList> {
        loop {
            if let ServerEnvelope::RoomsList(list) = self.recv().await? {
                return Ok(list);
            }
        }
    }

    /// Next `roomsList` satisfying `predicate`.
    pub async fn recv_rooms_list_where(
        &mut self,
        predicate: impl Fn(&RoomsList) -> bool,
    ) -> anyhow::Result<RoomsList> {
        loop {
            let list = self.recv_rooms_list().await?;
            if predicate(&list) {
                return Ok(list);
            }
        }
    }

    /// Fail if anything other than a `roomsList` arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.socket.next()).await {
                Err(_) => return Ok(()),
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                    bail!("{}: connection closed", self.participant_id)
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    let envelope: ServerEnvelope = serde_json::from_str(&text)?;
                    if !matches!(envelope, ServerEnvelope::RoomsList(_)) {
                        bail!("{}: unexpected {envelope:?}", self.participant_id);
                    }
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => return Err(e.into()),
            }
        }
    }

    /// Read until the server closes the connection.
    pub async fn wait_for_close(&mut self) -> anyhow::Result<()> {
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.socket.next()).await {
                Err(_) => bail!("{}: connection was not closed", self.participant_id),
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) => return Ok(()),
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    /// Close from the client side.
    pub async fn close(mut self) -> anyhow::Result<()> {
        self.socket.close(None).await?;
        Ok(())
    }
}
