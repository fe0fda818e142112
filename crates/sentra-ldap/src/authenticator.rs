//! LDAP login flow.

use crate::client::{LdapClient, LdapIdentity};
use crate::config::LdapSettings;
use crate::error::{LdapError, LdapResult};
use sentra_auth::{resolve_roles, AuthenticatedUser, JitSettings, ProvisioningService};
use sentra_core::audit::{self, actions, AuditEvent, AuditSink};
use sentra_db::models::identity_provider::{IdentityProvider, ProviderDriver};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

/// An LDAP login attempt.
#[derive(Debug, Clone)]
pub struct LdapLogin<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// LDAP federation authenticator.
pub struct LdapAuthenticator {
    client: Arc<dyn LdapClient>,
    provisioning: ProvisioningService,
    audit: Arc<dyn AuditSink>,
}

impl LdapAuthenticator {
    #[must_use]
    pub fn new(
        client: Arc<dyn LdapClient>,
        provisioning: ProvisioningService,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            client,
            provisioning,
            audit,
        }
    }

    /// Authenticate against the directory and JIT-provision the account.
    #[instrument(skip(self, provider, login), fields(provider_key = %provider.key))]
    pub async fn authenticate(
        &self,
        provider: &IdentityProvider,
        login: LdapLogin<'_>,
    ) -> LdapResult<AuthenticatedUser> {
        let result = self.run(provider, &login).await;

        match &result {
            Ok(user) => {
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::new(actions::LDAP_LOGIN)
                        .actor(user.user.id)
                        .entity("identity_provider", provider.key.clone())
                        .client(login.ip, login.user_agent)
                        .meta(json!({
                            "provider_key": provider.key,
                            "subject": user.subject,
                        })),
                )
                .await;
            }
            Err(e) => {
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::new(actions::LOGIN_FAILED)
                        .entity("identity_provider", provider.key.clone())
                        .client(login.ip, login.user_agent)
                        .meta(json!({
                            "provider_key": provider.key,
                            "driver": "ldap",
                            "errors": [e.to_string()],
                        })),
                )
                .await;
            }
        }

        result
    }

    async fn run(
        &self,
        provider: &IdentityProvider,
        login: &LdapLogin<'_>,
    ) -> LdapResult<AuthenticatedUser> {
        if login.username.trim().is_empty() {
            return Err(LdapError::MissingCredential("username"));
        }
        if login.password.is_empty() {
            return Err(LdapError::MissingCredential("password"));
        }

        match provider.parsed_driver() {
            Ok(ProviderDriver::Ldap) => {}
            _ => return Err(LdapError::WrongDriver(provider.driver.clone())),
        }

        let settings = LdapSettings::from_provider(provider)?;

        let identity = self
            .client
            .authenticate(&settings, login.username, login.password)
            .await
            .map_err(|e| {
                if e.is_invalid_credentials() {
                    LdapError::InvalidCredentials
                } else {
                    // Full detail for operators; callers get a generic 422.
                    tracing::error!(provider_key = %provider.key, error = %e, "ldap failure");
                    LdapError::Provider(e.to_string())
                }
            })?;

        let claims = claim_map(&identity);

        let email = first_value(&claims, &settings.email_attribute)
            .filter(|v| v.contains('@'))
            .ok_or_else(|| LdapError::MissingEmail(settings.email_attribute.clone()))?;

        let display_name = resolve_display_name(&claims, &settings.name_attribute, &email);

        let jit = JitSettings::from_config(&provider.config)?;
        let roles = resolve_roles(&jit, &claims);

        let provisioned = self
            .provisioning
            .provision(&jit, &email, Some(&display_name), &roles)
            .await?;

        Ok(AuthenticatedUser {
            user: provisioned.user,
            roles: provisioned.roles,
            created: provisioned.created,
            provider_key: provider.key.clone(),
            subject: identity.dn,
            email,
        })
    }
}

/// Attribute map with lowercase aliases; directory attribute names are
/// case-insensitive.
fn claim_map(identity: &LdapIdentity) -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    for (name, values) in &identity.attributes {
        map.insert(name.clone(), values.clone());
        let lower = name.to_lowercase();
        if lower != *name {
            map.entry(lower).or_insert_with(|| values.clone());
        }
    }
    map
}

fn first_value(claims: &HashMap<String, Vec<String>>, attr: &str) -> Option<String> {
    claims
        .get(attr)
        .or_else(|| claims.get(&attr.to_lowercase()))
        .and_then(|values| values.iter().find(|v| !v.trim().is_empty()))
        .map(|v| v.trim().to_string())
}

/// Display name fallback chain: configured attribute, `displayName`,
/// `givenName` + `sn`, then the email address.
fn resolve_display_name(
    claims: &HashMap<String, Vec<String>>,
    name_attribute: &str,
    email: &str,
) -> String {
    if let Some(name) = first_value(claims, name_attribute) {
        return name;
    }
    if let Some(name) = first_value(claims, "displayname") {
        return name;
    }
    let given = first_value(claims, "givenname");
    let surname = first_value(claims, "sn");
    match (given, surname) {
        (Some(g), Some(s)) => format!("{g} {s}"),
        (Some(g), None) => g,
        (None, Some(s)) => s,
        (None, None) => email.to_string(),
    }
}
