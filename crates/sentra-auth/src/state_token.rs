//! Signed federation state tokens.
//!
//! The `RelayState` carried through a SAML round trip is not an opaque
//! blob: it is a compact, versioned, HMAC-SHA256-signed token of three
//! base64url segments (`header.payload.signature`) describing the original
//! federation request. Tokens are single-use; a cache-backed replay marker
//! keyed by the request id is flipped from `pending` to `consumed` on the
//! first successful validation.
//!
//! Key rotation keeps in-flight tokens valid across a secret change:
//! verification walks an ordered `[primary, previous]` key list and accepts
//! the first key that verifies. The `kid` header records which key signed a
//! token but is never trusted to select the verification key, since it is
//! attacker-controlled on the inbound path.

use crate::error::{AuthError, AuthResult};
use crate::replay::ReplayGuard;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Current token format version.
pub const STATE_TOKEN_VERSION: u32 = 1;

/// Clock-skew tolerance applied to `issued_at` checks.
const CLOCK_SKEW_SECS: i64 = 120;

/// Maximum accepted token length, well above anything we ever issue.
const MAX_TOKEN_LEN: usize = 8 * 1024;

/// Which of the rotating keys produced a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyId {
    Primary,
    Previous,
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyId::Primary => write!(f, "primary"),
            KeyId::Previous => write!(f, "previous"),
        }
    }
}

/// Signing key set. `previous` holds the outgoing key during rotation.
#[derive(Clone)]
pub struct StateKeys {
    primary: Vec<u8>,
    previous: Option<Vec<u8>>,
}

impl StateKeys {
    #[must_use]
    pub fn new(primary: impl Into<Vec<u8>>) -> Self {
        Self {
            primary: primary.into(),
            previous: None,
        }
    }

    #[must_use]
    pub fn with_previous(mut self, previous: impl Into<Vec<u8>>) -> Self {
        self.previous = Some(previous.into());
        self
    }

    /// Verification keys in trust order.
    fn verification_keys(&self) -> Vec<(KeyId, &[u8])> {
        let mut keys = vec![(KeyId::Primary, self.primary.as_slice())];
        if let Some(prev) = &self.previous {
            keys.push((KeyId::Previous, prev.as_slice()));
        }
        keys
    }

    fn key_bytes(&self, id: KeyId) -> Option<&[u8]> {
        match id {
            KeyId::Primary => Some(&self.primary),
            KeyId::Previous => self.previous.as_deref(),
        }
    }
}

impl std::fmt::Debug for StateKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateKeys")
            .field("primary", &"***REDACTED***")
            .field("previous", &self.previous.as_ref().map(|_| "***REDACTED***"))
            .finish()
    }
}

/// Client identity bound into a token at issue time.
#[derive(Debug, Clone, Copy)]
pub struct ClientBinding<'a> {
    pub ip: &'a str,
    pub user_agent: &'a str,
}

/// The signed request state carried in the token payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDescriptor {
    /// Protocol request id (SAML `AuthnRequest` ID).
    #[serde(rename = "rid")]
    pub request_id: String,
    #[serde(rename = "pid")]
    pub provider_id: Uuid,
    #[serde(rename = "pkey")]
    pub provider_key: String,
    /// Relative path to return the user to after login.
    #[serde(rename = "path", skip_serializing_if = "Option::is_none", default)]
    pub intended_path: Option<String>,
    /// Issue time, epoch seconds.
    #[serde(rename = "iat")]
    pub issued_at: i64,
    /// HMAC of `ip|user-agent`, hex-encoded.
    #[serde(rename = "cfp", skip_serializing_if = "Option::is_none", default)]
    pub client_hash: Option<String>,
    #[serde(rename = "iss")]
    pub issuer: String,
    #[serde(rename = "aud")]
    pub audience: String,
    #[serde(rename = "ver")]
    pub version: u32,
}

/// A descriptor plus its signed encoding.
#[derive(Debug, Clone)]
pub struct SignedState {
    pub descriptor: StateDescriptor,
    pub token: String,
    /// Key that produced the signature.
    pub signature_key: KeyId,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    typ: String,
    kid: KeyId,
}

/// Issues and validates federation state tokens.
pub struct StateTokenFactory {
    keys: StateKeys,
    issuer: String,
    audience: String,
    ttl_secs: i64,
    replay: ReplayGuard,
    /// When set, a token carrying a client hash is rejected unless the
    /// presenting client matches.
    enforce_fingerprint: bool,
}

impl StateTokenFactory {
    #[must_use]
    pub fn new(
        keys: StateKeys,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        ttl_secs: i64,
        replay: ReplayGuard,
    ) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            audience: audience.into(),
            ttl_secs,
            replay,
            enforce_fingerprint: true,
        }
    }

    #[must_use]
    pub fn enforce_fingerprint(mut self, enforce: bool) -> Self {
        self.enforce_fingerprint = enforce;
        self
    }

    /// Generate a fresh protocol request id.
    ///
    /// SAML requires NCName ids, so the value starts with an underscore.
    #[must_use]
    pub fn generate_request_id() -> String {
        use rand::rngs::OsRng;
        use rand::RngCore;

        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        format!("_{}", hex::encode(bytes))
    }

    /// Issue a signed state token and register its `pending` replay marker.
    pub async fn issue(
        &self,
        provider_id: Uuid,
        provider_key: &str,
        intended_path: Option<&str>,
        client: Option<ClientBinding<'_>>,
    ) -> AuthResult<SignedState> {
        if let Some(path) = intended_path {
            if !path.starts_with('/') || path.starts_with("//") {
                return Err(AuthError::InvalidIntendedPath);
            }
        }

        let descriptor = StateDescriptor {
            request_id: Self::generate_request_id(),
            provider_id,
            provider_key: provider_key.to_string(),
            intended_path: intended_path.map(str::to_string),
            issued_at: Utc::now().timestamp(),
            client_hash: client.map(|c| compute_client_hash(&self.keys.primary, c)),
            issuer: self.issuer.clone(),
            audience: self.audience.clone(),
            version: STATE_TOKEN_VERSION,
        };

        let token = self.sign_with_key(&descriptor, KeyId::Primary)?;
        self.replay.register(&descriptor.request_id).await?;

        tracing::debug!(
            request_id = %descriptor.request_id,
            provider_key = %descriptor.provider_key,
            "issued federation state token"
        );

        Ok(SignedState {
            descriptor,
            token,
            signature_key: KeyId::Primary,
        })
    }

    /// Sign a descriptor with a specific key. Exposed so rotation can be
    /// exercised end to end (issue always signs with the primary key).
    pub fn sign_with_key(&self, descriptor: &StateDescriptor, kid: KeyId) -> AuthResult<String> {
        let key = self
            .keys
            .key_bytes(kid)
            .ok_or_else(|| AuthError::MalformedToken("no such signing key".to_string()))?;

        let header = TokenHeader {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
            kid,
        };

        let header_b64 = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&header)
                .map_err(|e| AuthError::MalformedToken(e.to_string()))?,
        );
        let payload_b64 = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(descriptor)
                .map_err(|e| AuthError::MalformedToken(e.to_string()))?,
        );

        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature = URL_SAFE_NO_PAD.encode(hmac_sha256(key, signing_input.as_bytes()));

        Ok(format!("{signing_input}.{signature}"))
    }

    /// Validate a token and consume its replay marker.
    ///
    /// A second call for the same request id always fails, even within the
    /// TTL window.
    pub async fn validate(
        &self,
        token: &str,
        client: Option<ClientBinding<'_>>,
    ) -> AuthResult<StateDescriptor> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(AuthError::MalformedToken("token too large".to_string()));
        }

        let mut parts = token.split('.');
        let (header_b64, payload_b64, signature_b64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(p), Some(s), None) => (h, p, s),
                _ => {
                    return Err(AuthError::MalformedToken(
                        "expected three segments".to_string(),
                    ))
                }
            };

        let header: TokenHeader = serde_json::from_slice(
            &URL_SAFE_NO_PAD
                .decode(header_b64)
                .map_err(|e| AuthError::MalformedToken(e.to_string()))?,
        )
        .map_err(|e| AuthError::MalformedToken(e.to_string()))?;

        if header.alg != "HS256" {
            return Err(AuthError::UnsupportedAlgorithm(header.alg));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| AuthError::MalformedToken(e.to_string()))?;
        let signing_input = format!("{header_b64}.{payload_b64}");

        // Ordered key walk; at most one key verifies.
        let mut verified_with: Option<KeyId> = None;
        for (kid, key) in self.keys.verification_keys() {
            let expected = hmac_sha256(key, signing_input.as_bytes());
            if bool::from(expected.as_slice().ct_eq(signature.as_slice())) {
                verified_with = Some(kid);
                break;
            }
        }
        let verified_with = verified_with.ok_or(AuthError::BadSignature)?;

        let descriptor: StateDescriptor = serde_json::from_slice(
            &URL_SAFE_NO_PAD
                .decode(payload_b64)
                .map_err(|e| AuthError::MalformedToken(e.to_string()))?,
        )
        .map_err(|e| AuthError::MalformedToken(e.to_string()))?;

        if descriptor.version != STATE_TOKEN_VERSION {
            return Err(AuthError::VersionMismatch(descriptor.version));
        }

        let now = Utc::now().timestamp();
        if descriptor.issued_at > now + CLOCK_SKEW_SECS {
            return Err(AuthError::IssuedInFuture);
        }
        if descriptor.issued_at + self.ttl_secs + CLOCK_SKEW_SECS < now {
            return Err(AuthError::TokenExpired);
        }

        if descriptor.issuer != self.issuer || descriptor.audience != self.audience {
            return Err(AuthError::WrongParty);
        }

        // Single-use gate: atomically flip pending -> consumed.
        self.replay.consume(&descriptor.request_id).await?;

        // Fingerprint check recomputes with the key that actually verified
        // the signature, so rotation does not invalidate bound tokens.
        if self.enforce_fingerprint {
            if let Some(expected_hash) = &descriptor.client_hash {
                let key = self
                    .keys
                    .key_bytes(verified_with)
                    .ok_or(AuthError::BadSignature)?;
                let presented = client
                    .map(|c| compute_client_hash(key, c))
                    .unwrap_or_default();
                if !bool::from(presented.as_bytes().ct_eq(expected_hash.as_bytes())) {
                    tracing::warn!(
                        request_id = %descriptor.request_id,
                        "state token client fingerprint mismatch"
                    );
                    return Err(AuthError::FingerprintMismatch);
                }
            }
        }

        Ok(descriptor)
    }
}

/// HMAC of `ip|user-agent`, hex-encoded.
fn compute_client_hash(key: &[u8], client: ClientBinding<'_>) -> String {
    let material = format!("{}|{}", client.ip, client.user_agent);
    hex::encode(hmac_sha256(key, material.as_bytes()))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
