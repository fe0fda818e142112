//! Error types for the shared authentication machinery.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sentra_core::cache::CacheError;
use serde::Serialize;
use thiserror::Error;

/// Result type for shared auth operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors raised by state tokens, replay protection, JIT and provisioning.
#[derive(Debug, Error)]
pub enum AuthError {
    // State token errors
    #[error("State token is malformed: {0}")]
    MalformedToken(String),

    #[error("Unsupported state token algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("State token signature verification failed")]
    BadSignature,

    #[error("State token version mismatch: {0}")]
    VersionMismatch(u32),

    #[error("State token issued in the future")]
    IssuedInFuture,

    #[error("State token expired")]
    TokenExpired,

    #[error("State token issuer or audience mismatch")]
    WrongParty,

    #[error("Client fingerprint mismatch")]
    FingerprintMismatch,

    // Replay guard errors
    #[error("Federation request already consumed: {0}")]
    Replayed(String),

    #[error("Unknown or expired federation request: {0}")]
    UnknownRequest(String),

    // Validation errors
    #[error("Invalid intended path")]
    InvalidIntendedPath,

    #[error("Invalid JIT configuration: {0}")]
    InvalidJitConfig(String),

    // Provisioning errors
    #[error("No local account exists and provisioning is disabled")]
    ProvisioningDenied,

    #[error("User directory error: {0}")]
    Directory(String),

    // Infrastructure errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            // 401 - every state-token failure collapses to one generic
            // message so callers cannot probe which gate rejected them.
            AuthError::MalformedToken(detail)
            | AuthError::UnsupportedAlgorithm(detail) => {
                tracing::warn!(detail = ?detail, "state token rejected");
                (
                    StatusCode::UNAUTHORIZED,
                    "invalid_state",
                    "Authentication state is invalid or expired".to_string(),
                )
            }
            AuthError::BadSignature
            | AuthError::VersionMismatch(_)
            | AuthError::IssuedInFuture
            | AuthError::TokenExpired
            | AuthError::WrongParty
            | AuthError::FingerprintMismatch => (
                StatusCode::UNAUTHORIZED,
                "invalid_state",
                "Authentication state is invalid or expired".to_string(),
            ),
            AuthError::Replayed(request_id) => {
                tracing::warn!(request_id = ?request_id, "replay detected");
                (
                    StatusCode::UNAUTHORIZED,
                    "replay_detected",
                    "Authentication state is invalid or expired".to_string(),
                )
            }
            AuthError::UnknownRequest(_) => (
                StatusCode::UNAUTHORIZED,
                "unknown_request",
                "Authentication state is invalid or expired".to_string(),
            ),

            // 422 - field-scoped validation problems
            AuthError::InvalidIntendedPath => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_intended_path",
                "The post-login path must be a relative path".to_string(),
            ),
            AuthError::InvalidJitConfig(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_jit_config",
                msg.clone(),
            ),
            AuthError::ProvisioningDenied => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "provisioning_disabled",
                "No matching local account exists for this identity".to_string(),
            ),

            // 500 - infrastructure
            AuthError::Directory(msg) => {
                tracing::error!("user directory error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "directory_error",
                    "User directory error".to_string(),
                )
            }
            AuthError::Cache(e) => {
                tracing::error!("cache error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "cache_error",
                    "Cache backend error".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: error_code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}
