//! JWKS (JSON Web Key Set) models.

use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};

/// A provider's published key set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    /// Find a key by its key id.
    #[must_use]
    pub fn find_key(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }

    /// Find a verification key: by kid when the token names one, otherwise
    /// the first RSA key usable for signatures.
    #[must_use]
    pub fn find_signing_key(&self, kid: Option<&str>) -> Option<&Jwk> {
        match kid {
            Some(kid) => self.find_key(kid),
            None => self.keys.iter().find(|k| k.is_rsa() && k.is_signing_key()),
        }
    }
}

/// A single published key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type, e.g. `RSA`.
    pub kty: String,

    /// Public key use (`sig` or `enc`).
    #[serde(rename = "use")]
    pub use_: Option<String>,

    pub kid: Option<String>,

    pub alg: Option<String>,

    /// RSA modulus, base64url.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA exponent, base64url.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    /// X.509 certificate chain (published by Entra).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x5c: Option<Vec<String>>,
}

impl Jwk {
    #[must_use]
    pub fn is_rsa(&self) -> bool {
        self.kty == "RSA"
    }

    #[must_use]
    pub fn is_signing_key(&self) -> bool {
        self.use_.is_none() || self.use_.as_deref() == Some("sig")
    }

    /// Build a verification key from the RSA components.
    ///
    /// Returns `None` for non-RSA keys or keys missing `n`/`e`.
    #[must_use]
    pub fn decoding_key(&self) -> Option<DecodingKey> {
        if !self.is_rsa() {
            return None;
        }
        let n = self.n.as_deref()?;
        let e = self.e.as_deref()?;
        DecodingKey::from_rsa_components(n, e).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsa_key(kid: &str, use_: Option<&str>) -> Jwk {
        Jwk {
            kty: "RSA".to_string(),
            use_: use_.map(str::to_string),
            kid: Some(kid.to_string()),
            alg: Some("RS256".to_string()),
            n: Some("0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw".to_string()),
            e: Some("AQAB".to_string()),
            x5c: None,
        }
    }

    #[test]
    fn test_find_key_by_kid() {
        let jwks = JwkSet {
            keys: vec![rsa_key("key-1", Some("sig")), rsa_key("key-2", Some("sig"))],
        };

        assert_eq!(
            jwks.find_key("key-2").and_then(|k| k.kid.as_deref()),
            Some("key-2")
        );
        assert!(jwks.find_key("key-9").is_none());
    }

    #[test]
    fn test_find_signing_key_without_kid() {
        let jwks = JwkSet {
            keys: vec![rsa_key("enc-key", Some("enc")), rsa_key("sig-key", None)],
        };

        let key = jwks.find_signing_key(None).unwrap();
        assert_eq!(key.kid.as_deref(), Some("sig-key"));
    }

    #[test]
    fn test_decoding_key_from_components() {
        assert!(rsa_key("key-1", Some("sig")).decoding_key().is_some());

        let ec = Jwk {
            kty: "EC".to_string(),
            use_: Some("sig".to_string()),
            kid: None,
            alg: None,
            n: None,
            e: None,
            x5c: None,
        };
        assert!(ec.decoding_key().is_none());
    }
}
