//! LDAP driver settings, parsed from the provider's config map.

use crate::error::LdapError;
use sentra_db::models::identity_provider::IdentityProvider;
use serde::Deserialize;

fn default_port() -> u16 {
    389
}

fn default_user_filter() -> String {
    "(uid={username})".to_string()
}

fn default_email_attribute() -> String {
    "mail".to_string()
}

fn default_name_attribute() -> String {
    "cn".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

/// Connection and mapping settings for an LDAP provider.
#[derive(Clone, Deserialize)]
pub struct LdapSettings {
    /// Directory hostname or IP address.
    pub host: String,

    /// 389 for LDAP, 636 for LDAPS.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub use_ssl: bool,

    #[serde(default)]
    pub use_starttls: bool,

    /// Base DN for the user search.
    pub base_dn: String,

    /// Service account DN used for the search bind.
    pub bind_dn: String,

    /// Service account password.
    pub bind_password: String,

    /// Search filter; `{username}` is replaced with the escaped login name.
    #[serde(default = "default_user_filter")]
    pub user_filter: String,

    /// Attribute holding the user's email address.
    #[serde(default = "default_email_attribute")]
    pub email_attribute: String,

    /// Attribute holding the user's display name.
    #[serde(default = "default_name_attribute")]
    pub name_attribute: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl LdapSettings {
    /// Parse settings from a provider row.
    pub fn from_provider(provider: &IdentityProvider) -> Result<Self, LdapError> {
        serde_json::from_value(provider.config.clone())
            .map_err(|e| LdapError::Provider(format!("invalid ldap configuration: {e}")))
    }

    /// Directory URL for the configured transport.
    #[must_use]
    pub fn url(&self) -> String {
        if self.use_ssl {
            format!("ldaps://{}:{}", self.host, self.port)
        } else {
            format!("ldap://{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Debug for LdapSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_ssl", &self.use_ssl)
            .field("use_starttls", &self.use_starttls)
            .field("base_dn", &self.base_dn)
            .field("bind_dn", &self.bind_dn)
            .field("bind_password", &"***REDACTED***")
            .field("user_filter", &self.user_filter)
            .field("email_attribute", &self.email_attribute)
            .field("name_attribute", &self.name_attribute)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}
