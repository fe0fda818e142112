//! The login front door: provider registry, brute-force gate, and driver
//! dispatch.
//!
//! - [`registry`] - CRUD over configured identity providers while keeping
//!   the evaluation order a contiguous `1..N` permutation
//! - [`brute_force`] - sliding-window attempt limiter gating the login
//!   endpoint before any authenticator runs
//! - [`dispatch`] - the closed driver set routed to the three protocol
//!   authenticators

pub mod brute_force;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod store;

pub use brute_force::{BruteForceConfig, BruteForceGuard, SubjectStrategy};
pub use dispatch::{LoginContext, LoginOutcome, LoginRequest, LoginService};
pub use error::{LoginError, LoginResult};
pub use registry::{CreateProvider, ProviderRegistry, UpdateProvider};
pub use store::{InMemoryProviderStore, PostgresProviderStore, ProviderStore, StoreError};
