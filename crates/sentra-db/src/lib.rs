//! Database models for the sentra identity backend.
//!
//! Plain sqlx model structs with explicit queries, one file per table.
//! Services layer on top of these; nothing here holds business rules
//! beyond the row-level invariants the queries themselves enforce.

pub mod models;

pub use models::identity_provider::{
    CreateIdentityProvider, IdentityProvider, ProviderDriver, UpdateIdentityProvider,
};
pub use models::role::Role;
pub use models::user::{NewUser, User};
