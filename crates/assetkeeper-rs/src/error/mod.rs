//! Error taxonomy shared by the discovery, allocation and import paths.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("target is required")]
    InvalidTarget,

    #[error("invalid asset type prefix: {0:?}")]
    InvalidPrefix(String),

    #[error("identifier space exhausted for prefix {0}")]
    IdSpaceExhausted(String),

    #[error("{}", exit_message(.code, .detail))]
    ProbeExecutionFailure { code: Option<i32>, detail: String },

    #[error("invalid scanner output: {0}")]
    ProbeOutputMalformed(String),

    #[error("scanner timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("failed to launch scanner: {0}")]
    ProbeSpawn(#[source] std::io::Error),

    #[error("scanner i/o error: {0}")]
    ProbeIo(#[from] std::io::Error),

    #[error("{0}")]
    Validation(String),

    #[error("duplicate {field}: {value}")]
    DuplicateFingerprint { field: &'static str, value: String },

    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type InventoryResult<T> = Result<T, InventoryError>;

fn exit_message(code: &Option<i32>, detail: &str) -> String {
    if !detail.trim().is_empty() {
        return detail.trim().to_string();
    }
    match code {
        Some(code) => format!("scanner exited with code {code}"),
        None => "scanner terminated by signal".to_string(),
    }
}

impl InventoryError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidTarget | Self::InvalidPrefix(_) | Self::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::DuplicateFingerprint { .. } | Self::IdSpaceExhausted(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for InventoryError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_failure_prefers_captured_stderr() {
        let err = InventoryError::ProbeExecutionFailure {
            code: Some(1),
            detail: "nmap: permission denied\n".to_string(),
        };
        assert_eq!(err.to_string(), "nmap: permission denied");
    }

    #[test]
    fn execution_failure_without_stderr_reports_exit_code() {
        let err = InventoryError::ProbeExecutionFailure {
            code: Some(2),
            detail: String::new(),
        };
        assert_eq!(err.to_string(), "scanner exited with code 2");
    }

    #[test]
    fn duplicates_map_to_conflict() {
        let err = InventoryError::DuplicateFingerprint {
            field: "macAddress",
            value: "AA:BB:CC:DD:EE:FF".to_string(),
        };
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(InventoryError::InvalidTarget.status(), StatusCode::BAD_REQUEST);
        assert_eq!(InventoryError::IdSpaceExhausted("SER".into()).status(), StatusCode::CONFLICT);
        assert_eq!(InventoryError::Unauthorized("unauthorized").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            InventoryError::ProbeOutputMalformed("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
