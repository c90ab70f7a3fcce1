//! API error types and conversions

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use uuid::Uuid;

use crate::dispatch::DispatchError;
use crate::ledger::LedgerError;
use crate::storage::StorageError;

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    /// Invalid request parameters
    InvalidRequest(String),

    /// Resource not found
    NotFound(String),

    /// Request conflicts with the resource's current state
    Conflict(String),

    /// A dependency is down; `command_id` names the row left pending, if any
    Unavailable {
        message: String,
        command_id: Option<Uuid>,
    },

    /// Storage operation failed
    StorageError(String),

    /// Internal server error
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, command_id) = match self {
            ApiError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg, None),
            ApiError::Unavailable {
                message,
                command_id,
            } => (StatusCode::SERVICE_UNAVAILABLE, message, command_id),
            ApiError::StorageError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
        };

        let mut body = json!({
            "status": "error",
            "message": message,
        });
        if let Some(command_id) = command_id {
            body["command_id"] = json!(command_id);
        }

        (status, Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(_) | StorageError::ConnectionFailed(_) => {
                ApiError::Unavailable {
                    message: err.to_string(),
                    command_id: None,
                }
            }
            other => ApiError::StorageError(other.to_string()),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::UnknownCommand(_) => ApiError::NotFound(err.to_string()),
            LedgerError::Store(err) => err.into(),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation(_) => ApiError::InvalidRequest(err.to_string()),
            DispatchError::NotFound(_) => ApiError::NotFound(err.to_string()),
            DispatchError::NotPending { .. } => ApiError::Conflict(err.to_string()),
            DispatchError::TransportUnavailable { command_id, .. } => ApiError::Unavailable {
                message: err.to_string(),
                command_id: Some(command_id),
            },
            DispatchError::Store(err) => err.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}
