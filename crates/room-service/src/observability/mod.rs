//! Observability for the room coordinator.
//!
//! - [`health`] - liveness/readiness endpoints
//! - [`metrics`] - Prometheus metric definitions and recorder setup

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState, ReadinessResponse, ServingPhase};
