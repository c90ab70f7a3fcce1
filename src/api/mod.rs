//! HTTP API for the fleet hub
//!
//! A thin mapping onto the dispatcher, the command ledger and the store.
//! Every response uses the `{status, data}` / `{status, message}` envelope.
//!
//! ## Endpoints
//!
//! - `GET /health`
//! - `GET /api/status` - broker connection and ingestion counters
//! - `GET /api/data/agents`
//! - `GET /api/data/latest`, `GET /api/data/latest/:agent_id`
//! - `GET /api/data/history/:agent_id/:metric_type`
//! - `POST /api/commands/update-asn/:agent_id`
//! - `POST /api/commands/:agent_id`
//! - `POST /api/commands/retry/:command_id`
//! - `GET /api/commands/history/:agent_id`

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;

use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Build the router with every endpoint and the shared layers
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/status", get(routes::status::get_status))
        .route("/api/data/agents", get(routes::data::list_agents))
        .route("/api/data/latest", get(routes::data::latest_all))
        .route("/api/data/latest/:agent_id", get(routes::data::latest_for_agent))
        .route(
            "/api/data/history/:agent_id/:metric_type",
            get(routes::data::history),
        )
        .route(
            "/api/commands/update-asn/:agent_id",
            post(routes::commands::update_asn),
        )
        .route(
            "/api/commands/retry/:command_id",
            post(routes::commands::retry),
        )
        .route(
            "/api/commands/history/:agent_id",
            get(routes::commands::history),
        )
        .route("/api/commands/:agent_id", post(routes::commands::dispatch))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Spawn the API server
///
/// Binds `bind_addr` and serves in a background task. Returns the bound
/// address (useful with port 0).
pub async fn spawn_api_server(bind_addr: SocketAddr, state: ApiState) -> anyhow::Result<SocketAddr> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("API server error: {e}");
        }
    });

    Ok(addr)
}
