use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error type shared across the daemon.
///
/// Variants map onto the failure classes callers can act on: missing
/// entities, illegal power transitions, runtime trouble, and local I/O.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state for {action}: server is {state}")]
    InvalidState { action: String, state: String },

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("container runtime error: {0}")]
    RuntimeError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl DaemonError {
    pub fn invalid_state(action: impl Into<String>, state: impl std::fmt::Display) -> Self {
        DaemonError::InvalidState {
            action: action.into(),
            state: state.to_string(),
        }
    }
}

impl From<bollard::errors::Error> for DaemonError {
    fn from(e: bollard::errors::Error) -> Self {
        use bollard::errors::Error as B;
        match e {
            B::DockerResponseServerError {
                status_code: 404,
                message,
            } => DaemonError::NotFound(message),
            B::IOError { err } => DaemonError::Io(err),
            B::JsonDataError { .. } => DaemonError::Decode(e.to_string()),
            other => DaemonError::RuntimeError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(e: serde_json::Error) -> Self {
        DaemonError::Decode(e.to_string())
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = match &self {
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::InvalidState { .. } | DaemonError::Decode(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollard_404_maps_to_not_found() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        };
        assert!(matches!(DaemonError::from(err), DaemonError::NotFound(_)));
    }

    #[test]
    fn bollard_conflict_maps_to_runtime_error() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "conflict".into(),
        };
        assert!(matches!(
            DaemonError::from(err),
            DaemonError::RuntimeError(_)
        ));
    }
}
