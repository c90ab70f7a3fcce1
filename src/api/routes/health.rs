//! Health check endpoint

use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};

use crate::api::state::ApiState;

/// GET /health
///
/// 200 while the store answers, 503 otherwise. Broker loss does not make
/// the hub unhealthy: the supervisor reconnects on its own.
pub async fn health_check(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    let store = match state.store.health_check().await {
        Ok(health) => health,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "error",
                    "message": e.to_string(),
                })),
            );
        }
    };

    let code = if store.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": if store.healthy { "success" } else { "error" },
            "data": {
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "store": store,
                "broker": state.supervisor.state(),
            },
        })),
    )
}
