use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use ws_orchestrator::OrchestratorError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(%status, error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        match err {
            OrchestratorError::NotFound(_) => ApiError::NotFound(message),
            OrchestratorError::InvalidInput(_)
            | OrchestratorError::Template(_)
            | OrchestratorError::UnknownActionKind(_) => ApiError::BadRequest(message),
            OrchestratorError::InvalidState(_)
            | OrchestratorError::ResourceConflict(_)
            | OrchestratorError::PoolExhausted { .. } => ApiError::Conflict(message),
            OrchestratorError::Supervisor(_)
            | OrchestratorError::SupervisorTimeout { .. }
            | OrchestratorError::Account(_)
            | OrchestratorError::Allocator(_)
            | OrchestratorError::Route(_) => ApiError::Unavailable(message),
            _ => ApiError::Internal(message),
        }
    }
}
