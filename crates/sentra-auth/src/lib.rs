//! Shared authentication machinery for the federation drivers.
//!
//! - [`state_token`] - compact HMAC-signed state tokens carried through the
//!   SAML redirect as `RelayState`, with key rotation
//! - [`replay`] - cache-backed single-use markers keyed by request id
//! - [`jit`] - just-in-time settings and role resolution from claims
//! - [`provisioning`] - user creation/update and role sync at login time

pub mod error;
pub mod jit;
pub mod provisioning;
pub mod replay;
pub mod state_token;

pub use error::{AuthError, AuthResult};
pub use jit::{resolve_roles, ClaimLookup, JitSettings, RoleTemplate};
pub use provisioning::{
    AuthenticatedUser, DirectoryError, DirectoryUser, InMemoryUserDirectory, PgUserDirectory,
    ProvisionedUser, ProvisioningService, UserDirectory,
};
pub use replay::ReplayGuard;
pub use state_token::{
    ClientBinding, KeyId, SignedState, StateDescriptor, StateKeys, StateTokenFactory,
};
