//! TTL cache capability.
//!
//! The federation subsystem needs a small set of cache operations: plain
//! get/put with expiry, `pull` (get-and-delete), and an atomic
//! compare-and-swap used by the replay guard to flip a marker from
//! `pending` to `consumed` exactly once. Backends without a native
//! read-modify-write primitive must not emulate `compare_and_swap` with
//! separate get+put calls.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache backend errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Cache capability consumed by the replay guard and brute-force guard.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch a live (non-expired) value.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Store a value with a time-to-live.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Fetch and delete a value in one step.
    async fn pull(&self, key: &str) -> CacheResult<Option<String>>;

    /// Replace `expected` with `replacement` atomically, keeping the
    /// entry's remaining TTL. Returns `false` when the key is missing,
    /// expired, or holds a different value.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        replacement: &str,
    ) -> CacheResult<bool>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory cache with per-entry TTL.
///
/// All mutating paths run under a single write lock, so
/// `compare_and_swap` observes no interleavings.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCache {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Expiry is also enforced lazily on reads;
    /// this exists so long-lived processes can reclaim memory.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        before - entries.len()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn pull(&self, key: &str) -> CacheResult<Option<String>> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        replacement: &str,
    ) -> CacheResult<bool> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() && entry.value == expected => {
                entry.value = replacement.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
