//! LDAP federation driver.
//!
//! Validates directory credentials through an injected [`LdapClient`]
//! capability, resolves email and display name from directory attributes,
//! and provisions the local account through the shared JIT machinery.

pub mod authenticator;
pub mod client;
pub mod config;
pub mod error;

pub use authenticator::{LdapAuthenticator, LdapLogin};
pub use client::{Ldap3Client, LdapClient, LdapClientError, LdapIdentity, INVALID_CREDENTIALS};
pub use config::LdapSettings;
pub use error::{LdapError, LdapResult};
