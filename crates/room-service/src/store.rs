//! Room metadata persistence.
//!
//! Rooms live in memory; the store holds a best-effort mirror of each room's
//! metadata so other components (and the HTTP API) can check whether a room
//! exists without asking the registry.
//!
//! # Key Patterns
//!
//! - `room:{id}` - JSON-encoded [`RoomRecord`], written with an expiry
//!
//! Store failures are logged and counted by the implementations and returned
//! to the caller, which never surfaces them to participants.

use crate::errors::RoomError;
use crate::observability::metrics as prom;
use crate::protocol::RoomStatus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{ParticipantId, RoomId};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

/// Persisted room metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub id: RoomId,
    pub room_name: Option<String>,
    pub status: RoomStatus,
    pub created_at: DateTime<Utc>,
    pub owner_id: ParticipantId,
}

/// Storage key for a room record.
#[must_use]
pub fn room_key(room_id: &RoomId) -> String {
    format!("room:{room_id}")
}

/// Metadata mirror for rooms.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Write (or overwrite) a record, expiring after `ttl`.
    async fn save(&self, record: &RoomRecord, ttl: Duration) -> Result<(), RoomError>;

    async fn load(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, RoomError>;

    /// Delete a record. Deleting a missing record succeeds.
    async fn remove(&self, room_id: &RoomId) -> Result<(), RoomError>;
}

/// Store used when no mirror is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRoomStore;

#[async_trait]
impl RoomStore for NoopRoomStore {
    async fn save(&self, _record: &RoomRecord, _ttl: Duration) -> Result<(), RoomError> {
        Ok(())
    }

    async fn load(&self, _room_id: &RoomId) -> Result<Option<RoomRecord>, RoomError> {
        Ok(None)
    }

    async fn remove(&self, _room_id: &RoomId) -> Result<(), RoomError> {
        Ok(())
    }
}

/// Redis-backed store.
///
/// Cheaply cloneable: `MultiplexedConnection` is cloned per operation
/// instead of being shared behind a lock.
#[derive(Clone)]
pub struct RedisRoomStore {
    connection: MultiplexedConnection,
}

impl RedisRoomStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `RoomError::Store` if the URL is invalid or the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, RoomError> {
        // The URL may embed credentials; never log it.
        let client = Client::open(redis_url).map_err(|e| {
            error!(
                target: "rc.store.redis",
                error = %e,
                "Failed to open Redis client"
            );
            RoomError::Store(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "rc.store.redis",
                    error = %e,
                    "Failed to connect to Redis"
                );
                RoomError::Store(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self { connection })
    }
}

#[async_trait]
impl RoomStore for RedisRoomStore {
    #[instrument(skip_all, fields(room_id = %record.id))]
    async fn save(&self, record: &RoomRecord, ttl: Duration) -> Result<(), RoomError> {
        let mut conn = self.connection.clone();
        let key = room_key(&record.id);
        let value = serde_json::to_string(record)
            .map_err(|e| RoomError::Internal(format!("Failed to encode room record: {e}")))?;

        let started = Instant::now();
        let result: Result<(), _> = conn.set_ex(&key, value, ttl.as_secs().max(1)).await;
        prom::record_store_latency("save", started.elapsed());

        result.map_err(|e| {
            prom::record_store_error("save");
            warn!(
                target: "rc.store.redis",
                error = %e,
                room_id = %record.id,
                "Failed to save room record"
            );
            RoomError::Store(format!("Failed to save room record: {e}"))
        })?;

        debug!(
            target: "rc.store.redis",
            room_id = %record.id,
            status = %record.status,
            "Saved room record"
        );
        Ok(())
    }

    #[instrument(skip_all, fields(room_id = %room_id))]
    async fn load(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, RoomError> {
        let mut conn = self.connection.clone();
        let key = room_key(room_id);

        let started = Instant::now();
        let result: Result<Option<String>, _> = conn.get(&key).await;
        prom::record_store_latency("load", started.elapsed());

        let raw = result.map_err(|e| {
            prom::record_store_error("load");
            warn!(
                target: "rc.store.redis",
                error = %e,
                room_id = %room_id,
                "Failed to load room record"
            );
            RoomError::Store(format!("Failed to load room record: {e}"))
        })?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| {
                warn!(
                    target: "rc.store.redis",
                    error = %e,
                    room_id = %room_id,
                    "Stored room record is not valid JSON"
                );
                RoomError::Store(format!("Invalid room record: {e}"))
            })
        })
        .transpose()
    }

    #[instrument(skip_all, fields(room_id = %room_id))]
    async fn remove(&self, room_id: &RoomId) -> Result<(), RoomError> {
        let mut conn = self.connection.clone();
        let key = room_key(room_id);

        let started = Instant::now();
        let result: Result<(), _> = conn.del(&key).await;
        prom::record_store_latency("remove", started.elapsed());

        result.map_err(|e| {
            prom::record_store_error("remove");
            warn!(
                target: "rc.store.redis",
                error = %e,
                room_id = %room_id,
                "Failed to delete room record"
            );
            RoomError::Store(format!("Failed to delete room record: {e}"))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_room_key_format() {
        let id: RoomId = "6f1c2a56-52b1-4c43-a3f6-8fb5e1a3bf0e".parse().unwrap();
        assert_eq!(room_key(&id), "room:6f1c2a56-52b1-4c43-a3f6-8fb5e1a3bf0e");
    }

    #[test]
    fn test_record_wire_format() {
        let id: RoomId = "6f1c2a56-52b1-4c43-a3f6-8fb5e1a3bf0e".parse().unwrap();
        let record = RoomRecord {
            id,
            room_name: Some("pairing".to_string()),
            status: RoomStatus::Waiting,
            created_at: "2026-01-02T03:04:05Z".parse().unwrap(),
            owner_id: ParticipantId::new("alice"),
        };

        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "id": "6f1c2a56-52b1-4c43-a3f6-8fb5e1a3bf0e",
                "roomName": "pairing",
                "status": "waiting",
                "createdAt": "2026-01-02T03:04:05Z",
                "ownerId": "alice",
            })
        );
    }

    #[tokio::test]
    async fn test_noop_store_never_finds_anything() {
        let store = NoopRoomStore;
        let record = RoomRecord {
            id: RoomId::new(),
            room_name: None,
            status: RoomStatus::Playing,
            created_at: Utc::now(),
            owner_id: ParticipantId::new("bob"),
        };

        store.save(&record, Duration::from_secs(60)).await.unwrap();
        assert!(store.load(&record.id).await.unwrap().is_none());
        store.remove(&record.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_redis_connect_rejects_invalid_url() {
        let result = RedisRoomStore::connect("not a url").await;
        assert!(matches!(result, Err(RoomError::Store(_))));
    }
}
