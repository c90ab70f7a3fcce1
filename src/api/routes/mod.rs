pub mod commands;
pub mod data;
pub mod health;
pub mod status;

use axum::Json;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::api::error::{ApiError, ApiResult};

/// `{status: "success", data}` envelope shared by every endpoint
pub fn success<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({
        "status": "success",
        "data": data,
    }))
}

/// Parse an optional JSON body; an empty body yields `None`
pub fn parse_body<T: DeserializeOwned>(body: &[u8]) -> ApiResult<Option<T>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ApiError::InvalidRequest(format!("invalid JSON body: {e}")))
}
