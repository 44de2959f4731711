//! In-memory room metadata store.
//!
//! Stands in for Redis in tests. Writes can be made to fail so tests can
//! check that participants never see store errors.
//!
//! # Example
//!
//! ```rust,ignore
//! use room_test_utils::MemoryRoomStore;
//!
//! let store = Arc::new(MemoryRoomStore::new());
//! // ... drive the coordinator ...
//! assert_eq!(store.len(), 1);
//! ```

use async_trait::async_trait;
use common::types::RoomId;
use room_service::errors::RoomError;
use room_service::store::{RoomRecord, RoomStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Record plus the expiry it was written with.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub record: RoomRecord,
    pub ttl: Duration,
}

/// `RoomStore` backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    records: Mutex<HashMap<RoomId, StoredRecord>>,
    failing: AtomicBool,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose every operation fails.
    pub fn failing() -> Self {
        let store = Self::default();
        store.set_failing(true);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, room_id: &RoomId) -> Option<StoredRecord> {
        self.records.lock().unwrap().get(room_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a record directly, bypassing the coordinator.
    pub fn insert(&self, record: RoomRecord, ttl: Duration) {
        self.records
            .lock()
            .unwrap()
            .insert(record.id, StoredRecord { record, ttl });
    }

    fn check(&self, operation: &str) -> Result<(), RoomError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(RoomError::Store(format!("injected {operation} failure")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn save(&self, record: &RoomRecord, ttl: Duration) -> Result<(), RoomError> {
        self.check("save")?;
        self.insert(record.clone(), ttl);
        Ok(())
    }

    async fn load(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, RoomError> {
        self.check("load")?;
        Ok(self.get(room_id).map(|stored| stored.record))
    }

    async fn remove(&self, room_id: &RoomId) -> Result<(), RoomError> {
        self.check("remove")?;
        self.records.lock().unwrap().remove(room_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::ParticipantId;
    use room_service::protocol::RoomStatus;

    fn record() -> RoomRecord {
        RoomRecord {
            id: RoomId::new(),
            room_name: None,
            status: RoomStatus::Waiting,
            created_at: "2026-01-02T03:04:05Z".parse().unwrap(),
            owner_id: ParticipantId::new("alice"),
        }
    }

    #[tokio::test]
    async fn test_save_load_remove() {
        let store = MemoryRoomStore::new();
        let record = record();

        store.save(&record, Duration::from_secs(30)).await.unwrap();
        assert_eq!(store.load(&record.id).await.unwrap(), Some(record.clone()));
        assert_eq!(store.get(&record.id).unwrap().ttl, Duration::from_secs(30));

        store.remove(&record.id).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failing_store_rejects_everything() {
        let store = MemoryRoomStore::failing();
        let record = record();

        assert!(store.save(&record, Duration::from_secs(30)).await.is_err());
        assert!(store.load(&record.id).await.is_err());
        assert!(store.is_empty());

        store.set_failing(false);
        store.save(&record, Duration::from_secs(30)).await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
