//! Driver dispatch: one entry point for the login endpoint.
//!
//! The driver set is closed; each variant has materially different inputs,
//! so dispatch is a match over `(driver, request)` rather than any dynamic
//! lookup. The brute-force gate runs before a provider is even resolved.

use crate::brute_force::{BruteForceGuard, SubjectStrategy};
use crate::error::{LoginError, LoginResult};
use crate::registry::ProviderRegistry;
use sentra_auth::AuthenticatedUser;
use sentra_db::models::identity_provider::ProviderDriver;
use sentra_ldap::{LdapAuthenticator, LdapLogin};
use sentra_oidc::{OidcAuthenticator, OidcLogin};
use sentra_saml::{SamlAuthenticator, SamlCallback};
use std::sync::Arc;
use tracing::instrument;

/// The protocol-specific login material.
pub enum LoginRequest<'a> {
    Ldap(LdapLogin<'a>),
    Oidc(OidcLogin<'a>),
    Saml(SamlCallback<'a>),
}

/// Request-scoped client context.
#[derive(Debug, Clone, Copy)]
pub struct LoginContext<'a> {
    /// Rate-limit cookie presented by the client, if any.
    pub cookie: Option<&'a str>,
    pub ip: &'a str,
    pub user_agent: Option<&'a str>,
}

/// A completed login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: AuthenticatedUser,
    /// Where to send the user, recovered from SAML relay state.
    pub intended_path: Option<String>,
    /// Rate-limit cookie to set, when the session strategy minted one.
    pub set_cookie: Option<String>,
}

/// The login front door: brute-force gate, provider resolution, dispatch.
pub struct LoginService {
    registry: ProviderRegistry,
    guard: BruteForceGuard,
    strategy: SubjectStrategy,
    ldap: Arc<LdapAuthenticator>,
    oidc: Arc<OidcAuthenticator>,
    saml: Arc<SamlAuthenticator>,
}

impl LoginService {
    #[must_use]
    pub fn new(
        registry: ProviderRegistry,
        guard: BruteForceGuard,
        strategy: SubjectStrategy,
        ldap: Arc<LdapAuthenticator>,
        oidc: Arc<OidcAuthenticator>,
        saml: Arc<SamlAuthenticator>,
    ) -> Self {
        Self {
            registry,
            guard,
            strategy,
            ldap,
            oidc,
            saml,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Process one login attempt end to end.
    #[instrument(skip(self, request, ctx), fields(provider = %provider_ident))]
    pub async fn login(
        &self,
        provider_ident: &str,
        request: LoginRequest<'_>,
        ctx: LoginContext<'_>,
    ) -> LoginResult<LoginOutcome> {
        // The gate runs first; a locked-out subject never reaches a driver.
        let resolved = self.guard.resolve_subject(self.strategy, ctx.cookie, ctx.ip);
        self.guard
            .register_attempt(
                self.strategy,
                &resolved.subject,
                Some(ctx.ip),
                ctx.user_agent,
            )
            .await?;

        let provider = self.registry.find_by_id_or_key(provider_ident).await?;
        if !provider.enabled {
            return Err(LoginError::ProviderDisabled(provider.key.clone()));
        }

        let driver = provider
            .parsed_driver()
            .map_err(|_| LoginError::UnsupportedDriver(provider.driver.clone()))?;

        let (user, intended_path) = match (driver, request) {
            (ProviderDriver::Ldap, LoginRequest::Ldap(login)) => {
                (self.ldap.authenticate(&provider, login).await?, None)
            }
            (ProviderDriver::Oidc | ProviderDriver::Entra, LoginRequest::Oidc(login)) => {
                (self.oidc.authenticate(&provider, login).await?, None)
            }
            (ProviderDriver::Saml, LoginRequest::Saml(callback)) => {
                let success = self.saml.authenticate(&provider, callback).await?;
                (success.user, success.intended_path)
            }
            (driver, _) => {
                return Err(LoginError::Validation(format!(
                    "login payload does not match the {driver} driver"
                )))
            }
        };

        Ok(LoginOutcome {
            user,
            intended_path,
            set_cookie: resolved.set_cookie,
        })
    }
}
