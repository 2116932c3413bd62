use std::time::Duration;
use thiserror::Error;
use ws_ports::PortError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unknown action kind: {0}")]
    UnknownActionKind(String),

    #[error("Action kind '{0}' is already registered")]
    DuplicateActionKind(String),

    #[error("Invalid template catalog: {0}")]
    Template(String),

    #[error("Action '{action}' timed out after {timeout:?}")]
    ActionTimeout { action: String, timeout: Duration },

    #[error("Action '{action}' failed: {reason}")]
    ActionExecutionFailed { action: String, reason: String },

    #[error("Template '{template}' failed at step {sequence_order} ('{action}'): {reason}")]
    TemplateFatalFailure {
        template: String,
        action: String,
        sequence_order: i64,
        reason: String,
    },

    #[error("Port pool exhausted on host '{host}' (range {range})")]
    PoolExhausted { host: String, range: String },

    #[error("Resource conflict: {0}")]
    ResourceConflict(String),

    #[error("Port allocator error: {0}")]
    Allocator(String),

    #[error("Host account error: {0}")]
    Account(String),

    #[error("Service supervisor error: {0}")]
    Supervisor(String),

    #[error("Unit '{unit}' did not reach state '{expected}' within {timeout:?}")]
    SupervisorTimeout {
        unit: String,
        expected: String,
        timeout: Duration,
    },

    #[error("Route file error: {0}")]
    Route(String),

    #[error("Template rendering error: {0}")]
    Render(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl OrchestratorError {
    /// Step-level failures the executor may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ActionTimeout { .. } | OrchestratorError::ActionExecutionFailed { .. }
        )
    }

    pub fn action_failed(action: &str, reason: impl Into<String>) -> Self {
        OrchestratorError::ActionExecutionFailed {
            action: action.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<PortError> for OrchestratorError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::PoolExhausted { host, range } => {
                OrchestratorError::PoolExhausted { host, range }
            }
            PortError::Conflict { .. } | PortError::OutOfRange { .. } => {
                OrchestratorError::ResourceConflict(err.to_string())
            }
            other => OrchestratorError::Allocator(other.to_string()),
        }
    }
}

impl From<tera::Error> for OrchestratorError {
    fn from(err: tera::Error) -> Self {
        // tera nests the useful message in the source chain
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(inner) = source {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            source = inner.source();
        }
        OrchestratorError::Render(message)
    }
}
