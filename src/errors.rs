use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TermError {
    #[error("invalid session identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("session {0} already exists")]
    AlreadyExists(String),
    #[error("session limit reached ({limit} active)")]
    CapacityExceeded { limit: usize },
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("input of {actual} bytes exceeds the {limit} byte limit")]
    InputTooLarge { limit: usize, actual: usize },
    #[error("user mode requires a user token and none was supplied or cached")]
    UserTokenMissing,
    #[error("no delegated auth host is configured for this session")]
    DelegatedHostUnavailable,
    #[error("PTY I/O failed: {0}")]
    ProcessIo(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl TermError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TermError::InvalidIdentifier(_) => "invalid_identifier",
            TermError::AlreadyExists(_) => "already_exists",
            TermError::CapacityExceeded { .. } => "capacity_exceeded",
            TermError::SpawnFailed(_) => "spawn_failed",
            TermError::NotFound(_) => "not_found",
            TermError::InputTooLarge { .. } => "input_too_large",
            TermError::UserTokenMissing => "user_token_missing",
            TermError::DelegatedHostUnavailable => "delegated_host_unavailable",
            TermError::ProcessIo(_) => "process_io",
            TermError::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TermError::CapacityExceeded { .. } | TermError::SpawnFailed(_) | TermError::Internal(_)
        )
    }

    /// Deployment-level problems that a caller cannot fix by changing the request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TermError::DelegatedHostUnavailable)
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            TermError::InvalidIdentifier(raw) => serde_json::json!({ "value": raw }),
            TermError::AlreadyExists(id) | TermError::NotFound(id) => {
                serde_json::json!({ "session_id": id })
            }
            TermError::CapacityExceeded { limit } => serde_json::json!({ "limit": limit }),
            TermError::InputTooLarge { limit, actual } => {
                serde_json::json!({ "limit": limit, "actual": actual })
            }
            _ => serde_json::Value::Null,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            TermError::InvalidIdentifier(_)
            | TermError::InputTooLarge { .. }
            | TermError::UserTokenMissing => StatusCode::BAD_REQUEST,
            TermError::NotFound(_) => StatusCode::NOT_FOUND,
            TermError::AlreadyExists(_) => StatusCode::CONFLICT,
            TermError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            TermError::ProcessIo(_) => StatusCode::BAD_GATEWAY,
            TermError::SpawnFailed(_)
            | TermError::DelegatedHostUnavailable
            | TermError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for TermError {
    fn from(error: std::io::Error) -> Self {
        TermError::Internal(error.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
    pub fatal: bool,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl From<&TermError> for ErrorBody {
    fn from(error: &TermError) -> Self {
        Self {
            code: error.kind(),
            message: error.to_string(),
            retryable: error.is_retryable(),
            fatal: error.is_fatal(),
            details: error.details(),
        }
    }
}

impl IntoResponse for TermError {
    fn into_response(self) -> Response {
        let body = ErrorBody::from(&self);
        (self.status(), Json(serde_json::json!({ "error": body }))).into_response()
    }
}

pub type TermResult<T> = Result<T, TermError>;
