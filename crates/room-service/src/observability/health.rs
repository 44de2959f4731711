//! `/health` and `/ready` for the room coordinator.
//!
//! The coordinator moves through three phases. It is `starting` until the
//! listener is bound, `serving` while it accepts upgrades, and `draining`
//! from the shutdown signal until rooms are torn down. Only `serving` is
//! ready, so load balancers stop sending new sockets before rooms close.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle phase reported by `/ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServingPhase {
    Starting,
    Serving,
    Draining,
}

impl ServingPhase {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ServingPhase::Serving,
            2 => ServingPhase::Draining,
            _ => ServingPhase::Starting,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            ServingPhase::Starting => 0,
            ServingPhase::Serving => 1,
            ServingPhase::Draining => 2,
        }
    }
}

/// Shared serving phase, flipped by `main` and read by the handlers.
#[derive(Debug)]
pub struct HealthState {
    phase: AtomicU8,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(ServingPhase::Starting.as_u8()),
        }
    }

    /// Listener is bound and accepting connections.
    pub fn mark_serving(&self) {
        // Draining is terminal.
        let _ = self.phase.compare_exchange(
            ServingPhase::Starting.as_u8(),
            ServingPhase::Serving.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Shutdown has begun.
    pub fn mark_draining(&self) {
        self.phase
            .store(ServingPhase::Draining.as_u8(), Ordering::Release);
    }

    #[must_use]
    pub fn phase(&self) -> ServingPhase {
        ServingPhase::from_u8(self.phase.load(Ordering::Acquire))
    }
}

/// Body of `/ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub status: ServingPhase,
}

/// Router for the liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(health_state)
}

/// Answers as long as the runtime is scheduling requests.
async fn health_check() -> &'static str {
    "OK"
}

async fn readiness_check(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let phase = state.phase();
    let code = match phase {
        ServingPhase::Serving => StatusCode::OK,
        ServingPhase::Starting | ServingPhase::Draining => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(ReadinessResponse { status: phase }))
}
