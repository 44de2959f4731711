//! Code Room coordinator library.
//!
//! Coordinates collaborative code-editing rooms over WebSocket:
//!
//! - Room lifecycle (`waiting` -> `playing` -> `closed`) with a single host
//! - Ready/start handshake and editor-content fan-out to every member
//! - Discovery listing of waiting rooms, pushed to every connected participant
//! - Best-effort mirror of room metadata to Redis
//!
//! # Architecture
//!
//! ```text
//! axum router (/ws, /api/v1/rooms, /health, /ready, /metrics)
//! └── ConnectionActor per socket
//!     ├── RegistryActor (create / join / depart / list)
//!     └── RoomActor     (ready / start / update)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry, room and connection actors
//! - [`auth`] - Participant identity resolution for the upgrade
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-facing messages
//! - [`observability`] - Prometheus metrics and health probes
//! - [`protocol`] - Wire envelopes
//! - [`routes`] - HTTP and WebSocket routes
//! - [`store`] - Room metadata persistence

pub mod actors;
pub mod auth;
pub mod config;
pub mod errors;
pub mod observability;
pub mod protocol;
pub mod routes;
pub mod store;
