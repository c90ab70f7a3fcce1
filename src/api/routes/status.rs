//! Pipeline status endpoint

use axum::{Json, extract::State};
use serde_json::{Value, json};

use super::success;
use crate::api::state::ApiState;

/// GET /api/status
///
/// Broker connection state, ingestion counters and the stale command scan.
pub async fn get_status(State(state): State<ApiState>) -> Json<Value> {
    success(json!({
        "broker": {
            "state": state.supervisor.state(),
            "connections_established": state.supervisor.connections_established(),
        },
        "ingest": state.ingest.snapshot(),
        "stale_commands": state.watchdog.as_ref().map(|w| w.snapshot()),
    }))
}
