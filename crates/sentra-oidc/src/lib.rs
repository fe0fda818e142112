//! OpenID Connect federation driver, including the Entra variant.
//!
//! Accepts either a caller-supplied ID token or an authorization code to
//! exchange at the provider's token endpoint, validates the resulting ID
//! token against the provider's published keys, and feeds the claims into
//! the shared JIT provisioning machinery.

pub mod authenticator;
pub mod discovery;
pub mod error;
pub mod jwks;
pub mod jwks_cache;
pub mod token;

pub use authenticator::{OidcAuthenticator, OidcGrant, OidcLogin, OidcSettings};
pub use discovery::{DiscoveredEndpoints, DiscoveryCache};
pub use error::{OidcError, OidcResult};
pub use jwks::{Jwk, JwkSet};
pub use jwks_cache::JwksCache;
pub use token::{ExpectedToken, IdTokenClaims, IdTokenVerifier};
