//! Agent and telemetry read endpoints

use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::success;
use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
};
use crate::storage::{AgentRecord, MetricKind, MetricQuery};

/// Hard cap on history page size
const MAX_HISTORY_LIMIT: usize = 10_000;

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    /// Start time (RFC 3339)
    start: Option<DateTime<Utc>>,

    end: Option<DateTime<Utc>>,

    /// Max results (default: 1000)
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct AgentView {
    #[serde(flatten)]
    agent: AgentRecord,
    is_alive: bool,
}

/// GET /api/data/agents
pub async fn list_agents(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let now = Utc::now();
    let agents: Vec<AgentView> = state
        .store
        .list_agents()
        .await?
        .into_iter()
        .map(|agent| AgentView {
            is_alive: agent.is_alive(now, state.agent_liveness),
            agent,
        })
        .collect();

    Ok(success(agents))
}

/// GET /api/data/latest
pub async fn latest_all(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let latest = state.store.latest_metrics(None).await?;
    Ok(success(latest))
}

/// GET /api/data/latest/:agent_id
pub async fn latest_for_agent(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let latest = state
        .store
        .latest_metrics(Some(&agent_id))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::NotFound(format!("no metrics for agent {agent_id}")))?;

    Ok(success(latest))
}

/// GET /api/data/history/:agent_id/:metric_type
///
/// Newest first. `metric_type` is one of cpu, memory, disk, network,
/// temperature.
pub async fn history(
    State(state): State<ApiState>,
    Path((agent_id, metric_type)): Path<(String, String)>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Value>> {
    let kind: MetricKind = metric_type.parse().map_err(ApiError::InvalidRequest)?;

    if let (Some(start), Some(end)) = (params.start, params.end) {
        if start > end {
            return Err(ApiError::InvalidRequest(
                "start must not be after end".to_string(),
            ));
        }
    }

    let query = MetricQuery {
        start: params.start,
        end: params.end,
        limit: params.limit.map(|limit| limit.min(MAX_HISTORY_LIMIT)),
        ..MetricQuery::new(agent_id, kind)
    };

    let rows = state.store.query_metrics(query).await?;
    Ok(success(rows))
}
