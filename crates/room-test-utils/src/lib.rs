//! # Room Test Utilities
//!
//! Shared test utilities for the room coordinator.
//!
//! This crate provides:
//! - Server test harness (`TestRoomServer` for E2E tests)
//! - In-memory metadata store (`MemoryRoomStore`)
//! - WebSocket test client (`TestClient`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use room_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let server = TestRoomServer::spawn().await?;
//!     let mut alice = TestClient::connect(&server, "alice").await?;
//!
//!     alice.send_json(serde_json::json!({"type": "createRoom"})).await?;
//!     let info = alice.recv_room_info().await?;
//!     assert!(info.is_host);
//!     Ok(())
//! }
//! ```

pub mod memory_store;
pub mod server_harness;
pub mod ws_client;

// Re-export commonly used items
pub use memory_store::*;
pub use server_harness::*;
pub use ws_client::*;
