//! SAML driver error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sentra_auth::AuthError;
use serde::Serialize;
use thiserror::Error;

/// Result type for SAML operations.
pub type SamlResult<T> = Result<T, SamlError>;

/// SAML driver errors.
#[derive(Debug, Error)]
pub enum SamlError {
    // Validation errors (422)
    #[error("Missing SAMLResponse")]
    MissingResponse,

    #[error("SAMLResponse exceeds maximum size")]
    ResponseTooLarge,

    #[error("Provider driver is not saml: {0}")]
    WrongDriver(String),

    #[error("No usable email claim in assertion")]
    NoEmailClaim,

    // Provider misconfiguration (422)
    #[error("Provider has no certificate configured")]
    MissingCertificate,

    #[error("Invalid provider certificate: {0}")]
    InvalidCertificate(String),

    #[error("IdP metadata error: {0}")]
    Metadata(String),

    #[error("SP signing credentials error: {0}")]
    Credentials(String),

    // Authentication failures (401)
    #[error("SAMLResponse could not be parsed: {0}")]
    MalformedResponse(String),

    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("Response validation failed")]
    ValidationFailed(Vec<String>),

    #[error("Relay state was issued for a different provider")]
    StateProviderMismatch,

    // Outbound construction failures (500)
    #[error("AuthnRequest construction failed: {0}")]
    RequestBuildFailed(String),

    /// Shared auth machinery (state tokens, JIT, provisioning).
    #[error(transparent)]
    Auth(#[from] AuthError),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for SamlError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            SamlError::MissingResponse => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "missing_saml_response",
                "SAMLResponse is required".to_string(),
            ),
            SamlError::ResponseTooLarge => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "saml_response_too_large",
                "SAMLResponse exceeds the maximum accepted size".to_string(),
            ),
            SamlError::WrongDriver(driver) => {
                tracing::error!(driver = ?driver, "saml authenticator invoked for wrong driver");
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "wrong_driver",
                    "Provider is not a SAML provider".to_string(),
                )
            }
            SamlError::NoEmailClaim => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "missing_email_claim",
                "The assertion carries no usable email address".to_string(),
            ),
            SamlError::MissingCertificate => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "missing_certificate",
                "Provider has no signing certificate configured".to_string(),
            ),
            SamlError::InvalidCertificate(detail) => {
                tracing::error!(detail = ?detail, "invalid provider certificate");
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "invalid_certificate",
                    "Provider certificate could not be parsed".to_string(),
                )
            }
            SamlError::Metadata(detail) => {
                tracing::error!(detail = ?detail, "idp metadata error");
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "idp_metadata_error",
                    "Provider metadata could not be fetched or parsed".to_string(),
                )
            }
            SamlError::Credentials(detail) => {
                tracing::error!(detail = ?detail, "sp signing credentials error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "credentials_error",
                    "Service provider signing material is invalid".to_string(),
                )
            }

            // Authentication failures collapse to one generic body; the
            // specific gate goes to the logs and the audit trail only.
            SamlError::MalformedResponse(detail) => {
                tracing::warn!(detail = ?detail, "malformed SAMLResponse");
                (
                    StatusCode::UNAUTHORIZED,
                    "authentication_failed",
                    "Authentication failed".to_string(),
                )
            }
            SamlError::SignatureInvalid(detail) => {
                tracing::warn!(detail = ?detail, "SAML signature verification failed");
                (
                    StatusCode::UNAUTHORIZED,
                    "authentication_failed",
                    "Authentication failed".to_string(),
                )
            }
            SamlError::ValidationFailed(reasons) => {
                tracing::warn!(reasons = ?reasons, "SAML response validation failed");
                (
                    StatusCode::UNAUTHORIZED,
                    "authentication_failed",
                    "Authentication failed".to_string(),
                )
            }
            SamlError::StateProviderMismatch => (
                StatusCode::UNAUTHORIZED,
                "authentication_failed",
                "Authentication failed".to_string(),
            ),

            SamlError::RequestBuildFailed(detail) => {
                tracing::error!(detail = ?detail, "AuthnRequest construction failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "request_build_failed",
                    "Failed to construct the authentication request".to_string(),
                )
            }

            SamlError::Auth(inner) => return inner.into_response(),
        };

        let body = ErrorResponse {
            error: error_code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
