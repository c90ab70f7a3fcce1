//! Command dispatch and history endpoints

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{parse_body, success};
use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
};
use crate::command::{CommandFilter, CommandType};

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    command_type: String,

    #[serde(default)]
    command_data: Value,
}

/// POST /api/commands/update-asn/:agent_id
///
/// Body `{force}` is optional; an empty body means `force = false`.
pub async fn update_asn(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let payload: Value = parse_body(&body)?.unwrap_or(Value::Null);

    let record = state
        .dispatcher
        .dispatch(&agent_id, CommandType::UpdateAsn, payload)
        .await?;

    Ok(success(record))
}

/// POST /api/commands/:agent_id
pub async fn dispatch(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let request: CommandRequest = parse_body(&body)?
        .ok_or_else(|| ApiError::InvalidRequest("request body is required".to_string()))?;

    let command_type: CommandType = request
        .command_type
        .parse()
        .map_err(ApiError::InvalidRequest)?;

    let record = state
        .dispatcher
        .dispatch(&agent_id, command_type, request.command_data)
        .await?;

    Ok(success(record))
}

/// POST /api/commands/retry/:command_id
///
/// Republish a command that is still `pending` after a failed dispatch.
pub async fn retry(
    State(state): State<ApiState>,
    Path(command_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let command_id = parse_command_id(&command_id)?;
    let record = state.dispatcher.redispatch(command_id).await?;

    Ok(success(record))
}

/// GET /api/commands/history/:agent_id?limit&status
pub async fn history(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
    Query(filter): Query<CommandFilter>,
) -> ApiResult<Json<Value>> {
    let commands = state.ledger.list(&agent_id, &filter).await?;

    Ok(success(json!({
        "agent_id": agent_id,
        "count": commands.len(),
        "commands": commands,
    })))
}

fn parse_command_id(raw: &str) -> ApiResult<Uuid> {
    raw.parse()
        .map_err(|_| ApiError::InvalidRequest(format!("invalid command id: {raw}")))
}
