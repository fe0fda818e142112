//! Shared capabilities for the sentra identity backend.
//!
//! # Modules
//!
//! - [`cache`] - TTL cache capability backing replay markers and
//!   rate-limit windows
//! - [`audit`] - structured audit events and the fire-and-forget sink
//! - [`http`] - outbound HTTP client factory with enforced timeouts

pub mod audit;
pub mod cache;
pub mod http;

pub use audit::{emit, AuditEvent, AuditSink, RecordingAuditSink, TracingAuditSink};
pub use cache::{Cache, CacheError, InMemoryCache};
pub use http::outbound_client;
