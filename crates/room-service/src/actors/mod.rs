//! Actor model implementation for the room coordinator.
//!
//! ```text
//! RegistryActor (singleton)
//! ├── owns the room table and the connected-participant table
//! └── supervises N RoomActors
//!     └── RoomActor (one per room)
//!         └── owns membership, status, host and ready flags
//!
//! ConnectionActor (one per WebSocket)
//! └── inbound loop + outbound loop joined by a bounded outbox
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single owner per structure**: the registry alone mutates the room table,
//!   each room alone mutates its membership
//! - **No waiting on slow peers**: fan-out uses `try_send`; a full outbox evicts
//!   its participant instead of stalling the room
//! - **One-way room events**: rooms report to the registry on an unbounded
//!   channel, so the registry can await rooms without risk of deadlock
//! - **CancellationToken propagation**: rooms and connections hold child tokens
//!   of the registry's root token
//!
//! # Modules
//!
//! - [`registry`] - `RegistryActor` singleton that owns the room table
//! - [`room`] - `RoomActor` per room
//! - [`connection`] - `ConnectionActor` per WebSocket
//! - [`outbox`] - Per-participant bounded outbound queue
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod outbox;
pub mod registry;
pub mod room;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionSettings, WireFrame};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use outbox::{outbox, OutboxReceiver, ParticipantOutbox};
pub use registry::{RegistryActor, RegistryHandle, RegistrySettings};
pub use room::{RoomActor, RoomActorHandle};
