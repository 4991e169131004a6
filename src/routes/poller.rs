//! Poller status HTTP endpoint.
//!
//! GET /api/v1/poller/status — returns the current state of the background
//! poll loop as JSON.

use axum::extract::State;
use axum::Json;

use crate::services::poller::{PollerState, SharedPollerState};

/// Get the current poller status.
///
/// Returns the most recent cycle's counters plus timing (started/completed
/// timestamps, duration) and the running total of cycles completed.
#[utoipa::path(
    get,
    path = "/api/v1/poller/status",
    tag = "Poller",
    responses(
        (status = 200, description = "Current poller status", body = PollerState),
    )
)]
pub async fn get_poller_status(State(state): State<SharedPollerState>) -> Json<PollerState> {
    let s = state.read().await;
    Json(s.clone())
}
