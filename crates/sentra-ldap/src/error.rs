//! LDAP driver error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sentra_auth::AuthError;
use serde::Serialize;
use thiserror::Error;

/// Result type for LDAP driver operations.
pub type LdapResult<T> = Result<T, LdapError>;

/// LDAP driver errors, already classified per the error taxonomy.
#[derive(Debug, Error)]
pub enum LdapError {
    /// Empty username or password.
    #[error("Missing credential field: {0}")]
    MissingCredential(&'static str),

    /// Provider row handed to the wrong driver.
    #[error("Provider driver is not ldap: {0}")]
    WrongDriver(String),

    /// Directory rejected the bind.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Anything else the directory reported; administrator-facing.
    #[error("LDAP provider error: {0}")]
    Provider(String),

    /// The directory entry lacks a usable email attribute.
    #[error("No email attribute ({0}) on directory entry")]
    MissingEmail(String),

    /// Shared auth machinery (JIT config, provisioning).
    #[error(transparent)]
    Auth(#[from] AuthError),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for LdapError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            LdapError::MissingCredential(field) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "missing_credential",
                format!("The {field} field is required"),
            ),
            LdapError::WrongDriver(driver) => {
                tracing::error!(driver = ?driver, "ldap authenticator invoked for wrong driver");
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "wrong_driver",
                    "Provider is not an LDAP provider".to_string(),
                )
            }
            LdapError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                "invalid_credentials",
                "Authentication failed".to_string(),
            ),
            LdapError::Provider(detail) => {
                // Administrator detail stays in the logs, never the response.
                tracing::error!(detail = ?detail, "ldap provider error");
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "ldap_provider_error",
                    "The LDAP provider is misconfigured or unreachable".to_string(),
                )
            }
            LdapError::MissingEmail(attr) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "missing_email_attribute",
                format!("Directory entry has no usable {attr} attribute"),
            ),
            LdapError::Auth(inner) => return inner.into_response(),
        };

        let body = ErrorResponse {
            error: error_code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
