//! OIDC driver error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sentra_auth::AuthError;
use serde::Serialize;
use thiserror::Error;

/// Result type for OIDC driver operations.
pub type OidcResult<T> = Result<T, OidcError>;

/// OIDC driver errors.
#[derive(Debug, Error)]
pub enum OidcError {
    // Provider misconfiguration (422)
    #[error("Invalid OIDC configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Provider driver is not oidc: {0}")]
    WrongDriver(String),

    #[error("Discovery failed for issuer {issuer}: {message}")]
    DiscoveryFailed { issuer: String, message: String },

    #[error("Failed to fetch JWKS: {0}")]
    JwksFetchFailed(String),

    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    // Authentication failures (401)
    #[error("ID token is invalid: {0}")]
    InvalidIdToken(String),

    #[error("ID token has expired")]
    TokenExpired,

    #[error("Invalid issuer")]
    InvalidIssuer,

    #[error("Audience does not contain the configured client")]
    InvalidAudience,

    #[error("Nonce mismatch")]
    NonceMismatch,

    #[error("No signing key matches the token")]
    KeyNotFound,

    // Validation (422)
    #[error("Required claim missing: {0}")]
    MissingClaim(&'static str),

    /// Shared auth machinery (JIT config, provisioning).
    #[error(transparent)]
    Auth(#[from] AuthError),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for OidcError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            OidcError::InvalidConfiguration(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_configuration",
                msg,
            ),
            OidcError::WrongDriver(driver) => {
                tracing::error!(driver = ?driver, "oidc authenticator invoked for wrong driver");
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "wrong_driver",
                    "Provider is not an OIDC provider".to_string(),
                )
            }
            OidcError::DiscoveryFailed { issuer, message } => {
                tracing::warn!(issuer = ?issuer, message = %message, "discovery failed");
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "discovery_failed",
                    "Failed to discover OIDC endpoints for the configured issuer".to_string(),
                )
            }
            OidcError::JwksFetchFailed(msg) => {
                tracing::error!("JWKS fetch failed: {}", msg);
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "jwks_fetch_failed",
                    "Failed to fetch identity provider signing keys".to_string(),
                )
            }
            OidcError::TokenExchangeFailed(msg) => {
                tracing::error!("token exchange failed: {}", msg);
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "token_exchange_failed",
                    "Token exchange with the identity provider failed".to_string(),
                )
            }

            // One generic body for every token-validation failure; the
            // specific gate is recorded in the logs only.
            OidcError::InvalidIdToken(detail) => {
                tracing::warn!(detail = ?detail, "ID token rejected");
                (
                    StatusCode::UNAUTHORIZED,
                    "authentication_failed",
                    "Authentication failed".to_string(),
                )
            }
            OidcError::TokenExpired
            | OidcError::InvalidIssuer
            | OidcError::InvalidAudience
            | OidcError::NonceMismatch
            | OidcError::KeyNotFound => (
                StatusCode::UNAUTHORIZED,
                "authentication_failed",
                "Authentication failed".to_string(),
            ),

            OidcError::MissingClaim(claim) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "missing_claim",
                format!("Required claim missing: {claim}"),
            ),

            OidcError::Auth(inner) => return inner.into_response(),
        };

        let body = ErrorResponse {
            error: error_code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
