//! OIDC discovery with a time-boxed document cache.
//!
//! Discovery documents change rarely, so they are cached for an hour per
//! issuer. A fresh fetch returns the document exactly as the provider
//! published it; the cached copy carries a `_cached_at` stamp, so callers
//! (and operators reading debug output) can tell a hit from a fetch.

use crate::error::{OidcError, OidcResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Default TTL for cached discovery documents (1 hour).
pub const DEFAULT_DISCOVERY_TTL: Duration = Duration::from_secs(3600);

/// Stamp key added to cached documents.
pub const CACHED_AT_KEY: &str = "_cached_at";

/// Endpoints extracted from a provider's discovery document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredEndpoints {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    pub jwks_uri: String,
}

#[derive(Debug, Clone)]
struct CachedDocument {
    document: Value,
    fetched_at: Instant,
}

/// Discovery document cache, keyed by normalized issuer.
#[derive(Clone)]
pub struct DiscoveryCache {
    cache: Arc<RwLock<HashMap<String, CachedDocument>>>,
    ttl: Duration,
    http: reqwest::Client,
    /// Dev/test escape hatch for plain-http issuers.
    allow_http: bool,
}

impl DiscoveryCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            http: sentra_core::http::outbound_client(),
            allow_http: false,
        }
    }

    /// Allow non-HTTPS issuers. Local development and tests only.
    #[must_use]
    pub fn allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    /// The well-known configuration URL for an issuer.
    #[must_use]
    pub fn well_known_url(issuer: &str) -> String {
        let issuer = issuer.trim_end_matches('/');
        format!("{issuer}/.well-known/openid-configuration")
    }

    /// Fetch (or reuse) the raw discovery document for an issuer.
    #[instrument(skip(self))]
    pub async fn document(&self, issuer: &str) -> OidcResult<Value> {
        let issuer = issuer.trim_end_matches('/').to_string();

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&issuer) {
                if cached.fetched_at.elapsed() < self.ttl {
                    debug!(issuer = %issuer, "discovery cache hit");
                    return Ok(cached.document.clone());
                }
            }
        }

        if !self.allow_http {
            validate_url_not_internal(&issuer).map_err(|e| OidcError::InvalidConfiguration(
                format!("issuer rejected: {e}"),
            ))?;
        }

        debug!(issuer = %issuer, "discovery cache miss, fetching");
        let document = self.fetch(&issuer).await?;

        // The cached copy is stamped; the fresh document is returned as
        // published.
        let mut stamped = document.clone();
        if let Some(obj) = stamped.as_object_mut() {
            obj.insert(
                CACHED_AT_KEY.to_string(),
                Value::from(chrono::Utc::now().timestamp()),
            );
        }
        let mut cache = self.cache.write().await;
        cache.insert(
            issuer.clone(),
            CachedDocument {
                document: stamped,
                fetched_at: Instant::now(),
            },
        );

        info!(issuer = %issuer, "discovery document cached");
        Ok(document)
    }

    /// Extract the endpoints this driver needs.
    pub async fn endpoints(&self, issuer: &str) -> OidcResult<DiscoveredEndpoints> {
        let document = self.document(issuer).await?;
        serde_json::from_value(document).map_err(|e| OidcError::DiscoveryFailed {
            issuer: issuer.to_string(),
            message: format!("document missing required fields: {e}"),
        })
    }

    /// Drop a cached document.
    pub async fn invalidate(&self, issuer: &str) {
        let issuer = issuer.trim_end_matches('/');
        let mut cache = self.cache.write().await;
        if cache.remove(issuer).is_some() {
            debug!(issuer = %issuer, "discovery cache entry invalidated");
        }
    }

    async fn fetch(&self, issuer: &str) -> OidcResult<Value> {
        let url = Self::well_known_url(issuer);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| OidcError::DiscoveryFailed {
                issuer: issuer.to_string(),
                message: format!("HTTP error: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(OidcError::DiscoveryFailed {
                issuer: issuer.to_string(),
                message: format!("HTTP status {}", response.status()),
            });
        }

        response
            .json()
            .await
            .map_err(|e| OidcError::DiscoveryFailed {
                issuer: issuer.to_string(),
                message: format!("JSON parse error: {e}"),
            })
    }
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        Self::new(DEFAULT_DISCOVERY_TTL)
    }
}

/// SSRF guard: issuers must be HTTPS and must not point at internal or
/// link-local infrastructure.
pub(crate) fn validate_url_not_internal(url_str: &str) -> Result<(), String> {
    let url = url::Url::parse(url_str).map_err(|e| format!("invalid URL: {e}"))?;

    if url.scheme() != "https" {
        return Err(format!("only HTTPS issuers are allowed, got {}", url.scheme()));
    }

    let host = url.host_str().ok_or_else(|| "URL has no host".to_string())?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        let blocked = match ip {
            IpAddr::V4(v4) => {
                v4.is_loopback()
                    || v4.is_private()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_unspecified()
                    || v4 == std::net::Ipv4Addr::new(169, 254, 169, 254)
            }
            IpAddr::V6(v6) => {
                let segs = v6.segments();
                v6.is_loopback()
                    || v6.is_unspecified()
                    || (segs[0] & 0xfe00) == 0xfc00
                    || (segs[0] & 0xffc0) == 0xfe80
            }
        };
        if blocked {
            return Err(format!("internal or private address not allowed: {host}"));
        }
    } else {
        let lower = host.to_lowercase();
        for blocked in ["localhost", "metadata.google.internal", "metadata.goog"] {
            if lower == blocked || lower.ends_with(&format!(".{blocked}")) {
                return Err(format!("blocked hostname: {host}"));
            }
        }
    }

    Ok(())
}
