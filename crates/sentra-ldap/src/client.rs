//! LDAP wire client capability.
//!
//! The authenticator consumes the directory through [`LdapClient`];
//! [`Ldap3Client`] is the production implementation. The one contract both
//! sides rely on: a rejected bind surfaces with the exact message
//! [`INVALID_CREDENTIALS`], everything else is treated as a provider
//! problem by the caller.

use crate::config::LdapSettings;
use async_trait::async_trait;
use ldap3::{ldap_escape, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use std::collections::HashMap;
use tracing::{debug, warn};

/// The one credential-failure message the authenticator classifies as 401.
pub const INVALID_CREDENTIALS: &str = "Invalid LDAP credentials.";

/// LDAP result code for invalidCredentials.
const RC_INVALID_CREDENTIALS: u32 = 49;

/// A bound directory identity.
#[derive(Debug, Clone)]
pub struct LdapIdentity {
    pub dn: String,
    /// Multi-valued entry attributes.
    pub attributes: HashMap<String, Vec<String>>,
}

/// Typed client failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct LdapClientError {
    pub message: String,
}

impl LdapClientError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_credentials() -> Self {
        Self::new(INVALID_CREDENTIALS)
    }

    /// Whether this failure is a plain credential rejection.
    #[must_use]
    pub fn is_invalid_credentials(&self) -> bool {
        self.message == INVALID_CREDENTIALS
    }
}

/// Directory bind-and-search capability.
#[async_trait]
pub trait LdapClient: Send + Sync {
    /// Authenticate `username`/`password` and return the entry's DN and
    /// attributes.
    async fn authenticate(
        &self,
        settings: &LdapSettings,
        username: &str,
        password: &str,
    ) -> Result<LdapIdentity, LdapClientError>;
}

/// `ldap3`-backed client: service bind, user search, re-bind as the user.
#[derive(Debug, Default, Clone)]
pub struct Ldap3Client;

impl Ldap3Client {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn connect(settings: &LdapSettings) -> Result<ldap3::Ldap, LdapClientError> {
        let url = settings.url();
        debug!(url = %url, "connecting to LDAP server");

        let conn_settings = LdapConnSettings::new()
            .set_conn_timeout(std::time::Duration::from_secs(settings.timeout_secs))
            .set_starttls(settings.use_starttls);

        let (conn, ldap) = LdapConnAsync::with_settings(conn_settings, &url)
            .await
            .map_err(|e| LdapClientError::new(format!("connection to {url} failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        Ok(ldap)
    }
}

#[async_trait]
impl LdapClient for Ldap3Client {
    async fn authenticate(
        &self,
        settings: &LdapSettings,
        username: &str,
        password: &str,
    ) -> Result<LdapIdentity, LdapClientError> {
        let mut ldap = Self::connect(settings).await?;

        // Service bind for the user search.
        let bind = ldap
            .simple_bind(&settings.bind_dn, &settings.bind_password)
            .await
            .map_err(|e| LdapClientError::new(format!("service bind failed: {e}")))?;
        if bind.rc != 0 {
            return Err(LdapClientError::new(format!(
                "service bind failed with code {}: {}",
                bind.rc, bind.text
            )));
        }

        // Locate the user entry.
        let filter = settings
            .user_filter
            .replace("{username}", &ldap_escape(username));
        let (entries, _) = ldap
            .search(&settings.base_dn, Scope::Subtree, &filter, vec!["*"])
            .await
            .map_err(|e| LdapClientError::new(format!("user search failed: {e}")))?
            .success()
            .map_err(|e| LdapClientError::new(format!("user search failed: {e}")))?;

        let Some(entry) = entries.into_iter().next() else {
            // Unknown account and wrong password are indistinguishable to
            // the caller.
            return Err(LdapClientError::invalid_credentials());
        };
        let entry = SearchEntry::construct(entry);
        let user_dn = entry.dn.clone();

        // Re-bind as the user to verify the password.
        let user_bind = ldap
            .simple_bind(&user_dn, password)
            .await
            .map_err(|e| LdapClientError::new(format!("user bind failed: {e}")))?;
        if user_bind.rc == RC_INVALID_CREDENTIALS {
            return Err(LdapClientError::invalid_credentials());
        }
        if user_bind.rc != 0 {
            return Err(LdapClientError::new(format!(
                "user bind failed with code {}: {}",
                user_bind.rc, user_bind.text
            )));
        }

        let _ = ldap.unbind().await;

        debug!(dn = %user_dn, "LDAP authentication succeeded");

        Ok(LdapIdentity {
            dn: user_dn,
            attributes: entry.attrs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_credentials_message_is_exact() {
        let err = LdapClientError::invalid_credentials();
        assert_eq!(err.to_string(), "Invalid LDAP credentials.");
        assert!(err.is_invalid_credentials());
    }

    #[test]
    fn test_other_errors_are_not_credential_failures() {
        let err = LdapClientError::new("connection to ldap://x failed: timeout");
        assert!(!err.is_invalid_credentials());
    }
}
