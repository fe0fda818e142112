//! Single-use markers for federation requests.
//!
//! A marker is written as `pending` when a request is issued and flipped to
//! `consumed` by the first successful validation. The flip is a cache-level
//! compare-and-swap, so two concurrent validations of the same token cannot
//! both win. Consumed markers keep their original TTL, defeating replay
//! within the window; expiry then clears them naturally.

use crate::error::{AuthError, AuthResult};
use sentra_core::cache::Cache;
use std::sync::Arc;
use std::time::Duration;

const PENDING: &str = "pending";
const CONSUMED: &str = "consumed";

/// Cache-backed replay guard keyed by protocol request id.
#[derive(Clone)]
pub struct ReplayGuard {
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl ReplayGuard {
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    fn key(request_id: &str) -> String {
        format!("federation:request:{request_id}")
    }

    /// Record a freshly issued request as pending.
    pub async fn register(&self, request_id: &str) -> AuthResult<()> {
        self.cache
            .put(&Self::key(request_id), PENDING, self.ttl)
            .await?;
        Ok(())
    }

    /// Consume a pending marker exactly once.
    pub async fn consume(&self, request_id: &str) -> AuthResult<()> {
        let key = Self::key(request_id);
        if self.cache.compare_and_swap(&key, PENDING, CONSUMED).await? {
            return Ok(());
        }

        // Lost the swap: either the marker was already consumed (replay) or
        // it never existed / lapsed (unknown request).
        match self.cache.get(&key).await? {
            Some(ref v) if v == CONSUMED => Err(AuthError::Replayed(request_id.to_string())),
            _ => Err(AuthError::UnknownRequest(request_id.to_string())),
        }
    }

    /// Whether a pending marker currently exists (diagnostics only).
    pub async fn is_pending(&self, request_id: &str) -> AuthResult<bool> {
        Ok(self
            .cache
            .get(&Self::key(request_id))
            .await?
            .as_deref()
            == Some(PENDING))
    }
}
