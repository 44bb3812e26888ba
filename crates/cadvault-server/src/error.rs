//! Error responses for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cadvault_core::{ErrorCategory, VaultError};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        let err = match self {
            ApiError::BadRequest(_) => return (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Vault(err) => err,
        };

        let code = match err {
            VaultError::Sync(_) => "SYNC_ERROR",
            VaultError::Conflict(_) => "CONFLICT",
            VaultError::AlreadyLocked { .. } => "ALREADY_LOCKED",
            VaultError::NotOwner { .. } => "NOT_OWNER",
            VaultError::Forbidden(_) => "FORBIDDEN",
            VaultError::FileLocked { .. } => "FILE_LOCKED",
            VaultError::NotFound(_) => "NOT_FOUND",
            VaultError::AlreadyExists(_) => "ALREADY_EXISTS",
            VaultError::InvalidTarget(_) => "INVALID_TARGET",
            VaultError::InvalidArgument(_) => "INVALID_ARGUMENT",
            VaultError::MalformedState(_) => "MALFORMED_STATE",
            VaultError::Io(_)
            | VaultError::Git(_)
            | VaultError::Serialization(_)
            | VaultError::Internal(_) => "INTERNAL_ERROR",
        };

        let status = match err.category() {
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Conflict => StatusCode::CONFLICT,
            ErrorCategory::Forbidden => StatusCode::FORBIDDEN,
            ErrorCategory::BadRequest => StatusCode::BAD_REQUEST,
            // Remote unreachable: the caller may retry later
            ErrorCategory::ServerError if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, code)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody {
            error: String,
            code: &'static str,
        }

        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            warn!("{} ({})", self, code);
        }

        let body = ErrorBody {
            error: self.to_string(),
            code,
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
