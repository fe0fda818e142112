//! Login front-door error types.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sentra_core::cache::CacheError;
use serde::Serialize;
use thiserror::Error;

/// Result type for the login front door.
pub type LoginResult<T> = Result<T, LoginError>;

/// Errors raised by the registry, the brute-force gate, and dispatch.
#[derive(Debug, Error)]
pub enum LoginError {
    // Validation (422)
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unsupported provider driver: {0}")]
    UnsupportedDriver(String),

    // Configuration (422)
    #[error("Provider registry has no backing store configured")]
    RegistryUnavailable,

    // Lookup (404 / 403)
    #[error("Identity provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Identity provider is disabled: {0}")]
    ProviderDisabled(String),

    // Brute force (429)
    #[error("Too many login attempts")]
    Locked {
        /// Seconds until the window frees up.
        retry_after: u64,
        limit: u32,
    },

    // Driver failures, already classified by their own crates
    #[error(transparent)]
    Ldap(#[from] sentra_ldap::LdapError),

    #[error(transparent)]
    Oidc(#[from] sentra_oidc::OidcError),

    #[error(transparent)]
    Saml(#[from] sentra_saml::SamlError),

    // Infrastructure (500)
    #[error("Provider store error: {0}")]
    Store(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for LoginError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            LoginError::Validation(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "validation_failed", msg)
            }
            LoginError::UnsupportedDriver(driver) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "unsupported_driver",
                format!("Unsupported provider driver: {driver}"),
            ),
            LoginError::RegistryUnavailable => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "registry_unavailable",
                "Provider registry has no backing store configured".to_string(),
            ),
            LoginError::ProviderNotFound(ident) => (
                StatusCode::NOT_FOUND,
                "provider_not_found",
                format!("Identity provider {ident} not found"),
            ),
            LoginError::ProviderDisabled(_key) => (
                StatusCode::FORBIDDEN,
                "provider_disabled",
                "Identity provider is disabled".to_string(),
            ),

            LoginError::Locked { retry_after, limit } => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    "Retry-After",
                    HeaderValue::from_str(&retry_after.to_string())
                        .unwrap_or(HeaderValue::from_static("1")),
                );
                headers.insert(
                    "X-RateLimit-Limit",
                    HeaderValue::from_str(&limit.to_string())
                        .unwrap_or(HeaderValue::from_static("0")),
                );
                headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));

                let body = ErrorResponse {
                    error: "too_many_attempts".to_string(),
                    message: "Too many login attempts, try again later".to_string(),
                };
                return (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response();
            }

            LoginError::Ldap(inner) => return inner.into_response(),
            LoginError::Oidc(inner) => return inner.into_response(),
            LoginError::Saml(inner) => return inner.into_response(),

            LoginError::Store(msg) => {
                tracing::error!("provider store error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_error",
                    "Provider store error".to_string(),
                )
            }
            LoginError::Cache(e) => {
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
