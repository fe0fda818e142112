//! JWKS fetching and caching.
//!
//! Signing keys are cached for 15 minutes per provider. A stampede on
//! expiry costs one extra fetch and nothing else, so there is no
//! single-flight machinery here.

use crate::error::{OidcError, OidcResult};
use crate::jwks::{Jwk, JwkSet};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Default TTL for cached key sets (15 minutes).
pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(900);

#[derive(Debug, Clone)]
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// JWKS cache keyed by JWKS URI (one per provider).
#[derive(Clone)]
pub struct JwksCache {
    cache: Arc<RwLock<HashMap<String, CachedJwks>>>,
    ttl: Duration,
    http: reqwest::Client,
}

impl JwksCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            http: sentra_core::http::outbound_client(),
        }
    }

    /// Get the key set, fetching when absent or expired.
    #[instrument(skip(self))]
    pub async fn get_keys(&self, jwks_uri: &str) -> OidcResult<JwkSet> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(jwks_uri) {
                if cached.fetched_at.elapsed() < self.ttl {
                    debug!(jwks_uri = %jwks_uri, "JWKS cache hit");
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(jwks_uri = %jwks_uri, "JWKS cache miss, fetching");
        self.fetch_and_cache(jwks_uri).await
    }

    /// Refetch regardless of cache state. Use after a key-not-found to pick
    /// up a rotation.
    #[instrument(skip(self))]
    pub async fn force_refresh(&self, jwks_uri: &str) -> OidcResult<JwkSet> {
        info!(jwks_uri = %jwks_uri, "force refreshing JWKS");
        self.fetch_and_cache(jwks_uri).await
    }

    /// Find a verification key, optionally by kid.
    pub async fn find_signing_key(
        &self,
        jwks_uri: &str,
        kid: Option<&str>,
    ) -> OidcResult<Option<Jwk>> {
        let jwks = self.get_keys(jwks_uri).await?;
        Ok(jwks.find_signing_key(kid).cloned())
    }

    /// Drop a cached entry.
    pub async fn invalidate(&self, jwks_uri: &str) {
        let mut cache = self.cache.write().await;
        if cache.remove(jwks_uri).is_some() {
            debug!(jwks_uri = %jwks_uri, "JWKS cache entry invalidated");
        }
    }

    async fn fetch_and_cache(&self, jwks_uri: &str) -> OidcResult<JwkSet> {
        let jwks = self.fetch(jwks_uri).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
            },
        );

        info!(jwks_uri = %jwks_uri, key_count = jwks.keys.len(), "JWKS cached");
        Ok(jwks)
    }

    async fn fetch(&self, jwks_uri: &str) -> OidcResult<JwkSet> {
        let response = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| OidcError::JwksFetchFailed(format!("HTTP error: {e}")))?;

        if !response.status().is_success() {
            return Err(OidcError::JwksFetchFailed(format!(
                "HTTP status {}",
                response.status()
            )));
        }

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| OidcError::JwksFetchFailed(format!("JSON parse error: {e}")))?;

        // An empty key set can never verify anything; treat it like a fetch
        // failure rather than caching a useless document.
        if jwks.keys.is_empty() {
            return Err(OidcError::JwksFetchFailed(
                "provider returned an empty key set".to_string(),
            ));
        }

        Ok(jwks)
    }
}

impl Default for JwksCache {
    fn default() -> Self {
        Self::new(DEFAULT_JWKS_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_jwks_json() -> String {
        r#"{
            "keys": [
                {
                    "kty": "RSA",
                    "use": "sig",
                    "kid": "key-1",
                    "alg": "RS256",
                    "n": "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw",
                    "e": "AQAB"
                }
            ]
        }"#
        .to_string()
    }

    #[tokio::test]
    async fn test_fetch_jwks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sample_jwks_json()))
            .mount(&server)
            .await;

        let cache = JwksCache::new(Duration::from_secs(60));
        let jwks = cache.get_keys(&format!("{}/jwks", server.uri())).await.unwrap();
        assert_eq!(jwks.keys.len(), 1);
        assert_eq!(jwks.keys[0].kid.as_deref(), Some("key-1"));
    }

    #[tokio::test]
    async fn test_cache_hit_avoids_second_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sample_jwks_json()))
            .expect(1)
            .mount(&server)
            .await;

        let cache = JwksCache::new(Duration::from_secs(60));
        let uri = format!("{}/jwks", server.uri());
        cache.get_keys(&uri).await.unwrap();
        cache.get_keys(&uri).await.unwrap();
    }

    #[tokio::test]
    async fn test_force_refresh_fetches_again() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sample_jwks_json()))
            .expect(2)
            .mount(&server)
            .await;

        let cache = JwksCache::new(Duration::from_secs(60));
        let uri = format!("{}/jwks", server.uri());
        cache.get_keys(&uri).await.unwrap();
        cache.force_refresh(&uri).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_key_set_is_hard_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"keys": []}"#))
            .mount(&server)
            .await;

        let cache = JwksCache::new(Duration::from_secs(60));
        let err = cache
            .get_keys(&format!("{}/jwks", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, OidcError::JwksFetchFailed(_)));
    }

    #[tokio::test]
    async fn test_malformed_jwks_is_hard_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let cache = JwksCache::new(Duration::from_secs(60));
        let err = cache
            .get_keys(&format!("{}/jwks", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, OidcError::JwksFetchFailed(_)));
    }

    #[tokio::test]
    async fn test_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let cache = JwksCache::new(Duration::from_secs(60));
        let err = cache
            .get_keys(&format!("{}/jwks", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, OidcError::JwksFetchFailed(_)));
    }
}
