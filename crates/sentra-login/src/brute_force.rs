//! Sliding-window login-attempt limiter.
//!
//! A window record `{first, count}` lives in the cache per
//! `(strategy, subject)`. Each attempt resets a lapsed window, increments
//! the counter, and writes the record back with TTL = window, so idle
//! subjects age out on their own. The guard knows nothing about protocol
//! drivers; it gates the login endpoint before any authenticator runs.

use crate::error::{LoginError, LoginResult};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sentra_core::audit::{self, actions, AuditEvent, AuditSink};
use sentra_core::cache::Cache;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::instrument;

type HmacSha256 = Hmac<Sha256>;

/// How the rate-limited subject is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectStrategy {
    /// Signed per-session cookie, falling back to the client IP.
    Session,
    /// Client IP address.
    Ip,
}

impl std::fmt::Display for SubjectStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubjectStrategy::Session => write!(f, "session"),
            SubjectStrategy::Ip => write!(f, "ip"),
        }
    }
}

/// Guard limits.
#[derive(Debug, Clone)]
pub struct BruteForceConfig {
    pub max_attempts: u32,
    pub window: Duration,
}

impl Default for BruteForceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(900),
        }
    }
}

/// One attempt window.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttemptWindow {
    /// Epoch seconds of the first attempt in the window.
    first: i64,
    count: u32,
}

/// What an allowed attempt still has left.
#[derive(Debug, Clone, Copy)]
pub struct AttemptBudget {
    pub limit: u32,
    pub remaining: u32,
}

/// A resolved rate-limit subject, possibly with a fresh cookie to set.
#[derive(Debug, Clone)]
pub struct ResolvedSubject {
    pub subject: String,
    /// Signed cookie value to hand back when the session strategy minted
    /// a new identifier.
    pub set_cookie: Option<String>,
}

/// Cache-backed sliding-window guard.
#[derive(Clone)]
pub struct BruteForceGuard {
    cache: Arc<dyn Cache>,
    config: BruteForceConfig,
    audit: Arc<dyn AuditSink>,
    cookie_key: Vec<u8>,
}

impl BruteForceGuard {
    #[must_use]
    pub fn new(
        cache: Arc<dyn Cache>,
        config: BruteForceConfig,
        audit: Arc<dyn AuditSink>,
        cookie_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            cache,
            config,
            audit,
            cookie_key: cookie_key.into(),
        }
    }

    /// Resolve the subject for a request.
    ///
    /// The session strategy trusts only a validly signed cookie; a missing
    /// or tampered cookie falls back to assigning a fresh cookie whose
    /// value is the client IP.
    #[must_use]
    pub fn resolve_subject(
        &self,
        strategy: SubjectStrategy,
        cookie: Option<&str>,
        ip: &str,
    ) -> ResolvedSubject {
        match strategy {
            SubjectStrategy::Ip => ResolvedSubject {
                subject: ip.to_string(),
                set_cookie: None,
            },
            SubjectStrategy::Session => {
                if let Some(value) = cookie.and_then(|c| self.verify_cookie(c)) {
                    return ResolvedSubject {
                        subject: value,
                        set_cookie: None,
                    };
                }
                ResolvedSubject {
                    subject: ip.to_string(),
                    set_cookie: Some(self.sign_cookie(ip)),
                }
            }
        }
    }

    /// Record an attempt and decide whether the subject is locked out.
    ///
    /// The 429 carries `Retry-After = max(1, window - (now - first))`.
    #[instrument(skip(self, ip, user_agent))]
    pub async fn register_attempt(
        &self,
        strategy: SubjectStrategy,
        subject: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> LoginResult<AttemptBudget> {
        let key = format!("bruteforce:{strategy}:{subject}");
        let now = Utc::now().timestamp();
        let window_secs = self.config.window.as_secs() as i64;

        let mut record = self
            .cache
            .get(&key)
            .await?
            .and_then(|raw| serde_json::from_str::<AttemptWindow>(&raw).ok())
            .unwrap_or(AttemptWindow { first: now, count: 0 });

        if now - record.first > window_secs {
            record = AttemptWindow {
                first: now,
                count: 0,
            };
        }

        record.count += 1;
        let serialized = serde_json::to_string(&record)
            .map_err(|e| LoginError::Store(format!("window serialization: {e}")))?;
        self.cache.put(&key, &serialized, self.config.window).await?;

        if record.count >= self.config.max_attempts {
            let retry_after = (window_secs - (now - record.first)).max(1) as u64;

            audit::emit(
                self.audit.as_ref(),
                AuditEvent::new(actions::LOGIN_LOCKED)
                    .client(ip, user_agent)
                    .meta(serde_json::json!({
                        "strategy": strategy.to_string(),
                        "attempts": record.count,
                        "retry_after": retry_after,
                    })),
            )
            .await;

            return Err(LoginError::Locked {
                retry_after,
                limit: self.config.max_attempts,
            });
        }

        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(actions::LOGIN_FAILED)
                .client(ip, user_agent)
                .meta(serde_json::json!({
                    "strategy": strategy.to_string(),
                    "attempts": record.count,
                })),
        )
        .await;

        Ok(AttemptBudget {
            limit: self.config.max_attempts,
            remaining: self.config.max_attempts - record.count,
        })
    }

    /// `value.signature` with an HMAC-SHA256 signature, hex-encoded.
    #[must_use]
    pub fn sign_cookie(&self, value: &str) -> String {
        format!("{value}.{}", self.hmac_hex(value))
    }

    fn verify_cookie(&self, cookie: &str) -> Option<String> {
        let (value, signature) = cookie.rsplit_once('.')?;
        let expected = self.hmac_hex(value);
        if bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            Some(value.to_string())
        } else {
            None
        }
    }

    fn hmac_hex(&self, value: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.cookie_key)
            .expect("HMAC can take key of any size");
        mac.update(value.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentra_core::audit::RecordingAuditSink;
    use sentra_core::cache::InMemoryCache;

    const COOKIE_KEY: &[u8] = b"cookie-signing-key-32-bytes-long";

    fn guard_with(
        cache: Arc<InMemoryCache>,
        audit: Arc<RecordingAuditSink>,
    ) -> BruteForceGuard {
        BruteForceGuard::new(cache, BruteForceConfig::default(), audit, COOKIE_KEY)
    }

    #[tokio::test]
    async fn test_fifth_attempt_locks() {
        let cache = Arc::new(InMemoryCache::new());
        let audit = Arc::new(RecordingAuditSink::new());
        let guard = guard_with(cache, audit.clone());

        for attempt in 1..=4u32 {
            let budget = guard
                .register_attempt(SubjectStrategy::Ip, "203.0.113.9", Some("203.0.113.9"), None)
                .await
                .unwrap();
            assert_eq!(budget.remaining, 5 - attempt);
        }

        let err = guard
            .register_attempt(SubjectStrategy::Ip, "203.0.113.9", Some("203.0.113.9"), None)
            .await
            .unwrap_err();
        match err {
            LoginError::Locked { retry_after, limit } => {
                assert_eq!(limit, 5);
                assert!((1..=900).contains(&retry_after));
            }
            other => panic!("expected Locked, got {other:?}"),
        }

        let events = audit.actions().await;
        assert_eq!(events.iter().filter(|a| *a == actions::LOGIN_FAILED).count(), 4);
        assert_eq!(events.iter().filter(|a| *a == actions::LOGIN_LOCKED).count(), 1);
    }

    #[tokio::test]
    async fn test_window_elapse_resets_counter() {
        let cache = Arc::new(InMemoryCache::new());
        let audit = Arc::new(RecordingAuditSink::new());
        let guard = guard_with(cache.clone(), audit);

        // Simulate a window whose first attempt is beyond the 900 s window.
        let stale = serde_json::to_string(&AttemptWindow {
            first: Utc::now().timestamp() - 1000,
            count: 5,
        })
        .unwrap();
        cache
            .put(
                "bruteforce:ip:203.0.113.9",
                &stale,
                Duration::from_secs(900),
            )
            .await
            .unwrap();

        // The elapsed window resets; this attempt counts as the first.
        let budget = guard
            .register_attempt(SubjectStrategy::Ip, "203.0.113.9", None, None)
            .await
            .unwrap();
        assert_eq!(budget.remaining, 4);
    }

    #[tokio::test]
    async fn test_subjects_are_isolated() {
        let cache = Arc::new(InMemoryCache::new());
        let audit = Arc::new(RecordingAuditSink::new());
        let guard = guard_with(cache, audit);

        for _ in 0..4 {
            guard
                .register_attempt(SubjectStrategy::Ip, "203.0.113.9", None, None)
                .await
                .unwrap();
        }

        // A different subject is unaffected.
        let budget = guard
            .register_attempt(SubjectStrategy::Ip, "198.51.100.7", None, None)
            .await
            .unwrap();
        assert_eq!(budget.remaining, 4);
    }

    #[tokio::test]
    async fn test_session_cookie_round_trip() {
        let cache = Arc::new(InMemoryCache::new());
        let audit = Arc::new(RecordingAuditSink::new());
        let guard = guard_with(cache, audit);

        // First sight: no cookie, fall back to IP and mint one.
        let resolved = guard.resolve_subject(SubjectStrategy::Session, None, "203.0.113.9");
        assert_eq!(resolved.subject, "203.0.113.9");
        let cookie = resolved.set_cookie.expect("a fresh cookie is assigned");

        // The signed cookie resolves back to the same subject.
        let resolved =
            guard.resolve_subject(SubjectStrategy::Session, Some(&cookie), "198.51.100.7");
        assert_eq!(resolved.subject, "203.0.113.9");
        assert!(resolved.set_cookie.is_none());

        // A tampered cookie is ignored and a new one is assigned.
        let mut tampered = cookie.clone();
        tampered.pop();
        tampered.push('x'); // never a hex digit
        let resolved =
            guard.resolve_subject(SubjectStrategy::Session, Some(&tampered), "198.51.100.7");
        assert_eq!(resolved.subject, "198.51.100.7");
        assert!(resolved.set_cookie.is_some());
    }

    #[tokio::test]
    async fn test_ip_strategy_never_sets_cookie() {
        let cache = Arc::new(InMemoryCache::new());
        let audit = Arc::new(RecordingAuditSink::new());
        let guard = guard_with(cache, audit);

        let resolved = guard.resolve_subject(SubjectStrategy::Ip, Some("whatever"), "203.0.113.9");
        assert_eq!(resolved.subject, "203.0.113.9");
        assert!(resolved.set_cookie.is_none());
    }
}
