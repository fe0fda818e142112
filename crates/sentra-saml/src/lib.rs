//! SAML 2.0 Service Provider driver.
//!
//! This crate implements the SP side of the exchange:
//! - outbound `AuthnRequest` construction with redirect-binding encoding and
//!   optional RSA-SHA256 query signing
//! - inbound `Response` validation: XML signature verification against the
//!   provider certificate, conditions/audience/subject-confirmation checks,
//!   and claim extraction
//! - SP metadata generation and IdP metadata parsing with a TTL cache
//!
//! Request state rides through `RelayState` as a signed token from
//! `sentra-auth`, giving replay protection end to end.

pub mod attributes;
pub mod authenticator;
pub mod authn_request;
pub mod error;
pub mod metadata;
pub mod response;
pub mod signature;
mod xml;

pub use attributes::{claim_map, resolve_email, EMAIL_CLAIM_CANDIDATES};
pub use authenticator::{SamlAuthSuccess, SamlAuthenticator, SamlCallback};
pub use authn_request::{
    deflate_base64, inflate_base64, parse_authn_request, redirect_query, AuthnRequestBuilder,
    BuiltAuthnRequest, ParsedAuthnRequest,
};
pub use error::{SamlError, SamlResult};
pub use metadata::{build_sp_metadata, parse_idp_metadata, IdpMetadata, IdpMetadataCache};
pub use response::{
    decode_response, parse_response, validate_response, ParsedAssertion, ParsedResponse,
    ValidationParams,
};
pub use signature::{sign_enveloped, verify_response_signature, SignatureLocation, SigningCredentials};
