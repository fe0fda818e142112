//! OIDC login flow.

use crate::discovery::DiscoveryCache;
use crate::error::{OidcError, OidcResult};
use crate::jwks_cache::JwksCache;
use crate::token::{self, ExpectedToken, IdTokenClaims, IdTokenVerifier};
use sentra_auth::{resolve_roles, AuthenticatedUser, JitSettings, ProvisioningService};
use sentra_core::audit::{self, actions, AuditEvent, AuditSink};
use sentra_db::models::identity_provider::{IdentityProvider, ProviderDriver};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

/// The credential material a caller presents.
#[derive(Debug, Clone, Copy)]
pub enum OidcGrant<'a> {
    /// A raw ID token obtained by the caller.
    IdToken(&'a str),
    /// An authorization code to exchange at the token endpoint.
    Code {
        code: &'a str,
        redirect_uri: &'a str,
        code_verifier: Option<&'a str>,
    },
}

/// An OIDC login attempt.
#[derive(Debug, Clone)]
pub struct OidcLogin<'a> {
    pub grant: OidcGrant<'a>,
    pub nonce: Option<&'a str>,
    pub ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// Connection settings parsed from the provider config.
#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
}

impl OidcSettings {
    /// Parse settings for the `oidc` and `entra` drivers.
    ///
    /// Entra providers may omit `issuer` and configure `tenant_id` instead;
    /// the issuer is then the tenant's v2.0 endpoint.
    pub fn from_provider(provider: &IdentityProvider) -> OidcResult<Self> {
        let driver = provider
            .parsed_driver()
            .map_err(|_| OidcError::WrongDriver(provider.driver.clone()))?;

        let issuer = match driver {
            ProviderDriver::Oidc => provider
                .config_str("issuer")
                .map(str::to_string)
                .ok_or_else(|| {
                    OidcError::InvalidConfiguration("issuer is required".to_string())
                })?,
            ProviderDriver::Entra => match provider.config_str("issuer") {
                Some(issuer) => issuer.to_string(),
                None => {
                    let tenant = provider.config_str("tenant_id").ok_or_else(|| {
                        OidcError::InvalidConfiguration(
                            "entra providers require issuer or tenant_id".to_string(),
                        )
                    })?;
                    format!("https://login.microsoftonline.com/{tenant}/v2.0")
                }
            },
            _ => return Err(OidcError::WrongDriver(provider.driver.clone())),
        };

        let client_id = provider
            .config_str("client_id")
            .map(str::to_string)
            .ok_or_else(|| OidcError::InvalidConfiguration("client_id is required".to_string()))?;
        let client_secret = provider
            .config_str("client_secret")
            .map(str::to_string)
            .ok_or_else(|| {
                OidcError::InvalidConfiguration("client_secret is required".to_string())
            })?;

        Ok(Self {
            issuer: issuer.trim_end_matches('/').to_string(),
            client_id,
            client_secret,
        })
    }
}

/// OIDC federation authenticator (also serves the Entra driver).
pub struct OidcAuthenticator {
    discovery: DiscoveryCache,
    verifier: IdTokenVerifier,
    http: reqwest::Client,
    provisioning: ProvisioningService,
    audit: Arc<dyn AuditSink>,
}

impl OidcAuthenticator {
    #[must_use]
    pub fn new(provisioning: ProvisioningService, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            discovery: DiscoveryCache::default(),
            verifier: IdTokenVerifier::new(JwksCache::default()),
            http: sentra_core::http::outbound_client(),
            provisioning,
            audit,
        }
    }

    /// Replace the caches; used when callers share caches across drivers.
    #[must_use]
    pub fn with_caches(mut self, discovery: DiscoveryCache, jwks: JwksCache) -> Self {
        self.discovery = discovery;
        self.verifier = IdTokenVerifier::new(jwks);
        self
    }

    /// Run the full login flow for one attempt.
    #[instrument(skip(self, provider, login), fields(provider_key = %provider.key))]
    pub async fn authenticate(
        &self,
        provider: &IdentityProvider,
        login: OidcLogin<'_>,
    ) -> OidcResult<AuthenticatedUser> {
        let result = self.run(provider, &login).await;

        match &result {
            Ok(user) => {
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::new(actions::OIDC_LOGIN)
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
                    AuditEvent::new(actions::OIDC_LOGIN_FAILED)
                        .entity("identity_provider", provider.key.clone())
                        .client(login.ip, login.user_agent)
                        .meta(json!({
                            "provider_key": provider.key,
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
        login: &OidcLogin<'_>,
    ) -> OidcResult<AuthenticatedUser> {
        let settings = OidcSettings::from_provider(provider)?;
        let endpoints = self.discovery.endpoints(&settings.issuer).await?;

        let id_token = match login.grant {
            OidcGrant::IdToken(token) => token.to_string(),
            OidcGrant::Code {
                code,
                redirect_uri,
                code_verifier,
            } => {
                token::exchange_code(
                    &self.http,
                    &endpoints.token_endpoint,
                    code,
                    &settings.client_id,
                    &settings.client_secret,
                    redirect_uri,
                    code_verifier,
                )
                .await?
                .id_token
            }
        };

        let claims = self
            .verifier
            .verify(
                &id_token,
                &endpoints.jwks_uri,
                ExpectedToken {
                    issuer: &settings.issuer,
                    client_id: &settings.client_id,
                    nonce: login.nonce,
                },
            )
            .await?;

        let email = resolve_email(&claims).ok_or(OidcError::MissingClaim("email"))?;
        let display_name = resolve_display_name(&claims, &email);

        let claim_map = claims.to_claim_map();
        let jit = JitSettings::from_config(&provider.config)?;
        let roles = resolve_roles(&jit, &claim_map);

        let provisioned = self
            .provisioning
            .provision(&jit, &email, Some(&display_name), &roles)
            .await?;

        Ok(AuthenticatedUser {
            user: provisioned.user,
            roles: provisioned.roles,
            created: provisioned.created,
            provider_key: provider.key.clone(),
            subject: claims.sub,
            email,
        })
    }
}

/// Email fallback chain: `email`, then `preferred_username` when it looks
/// like an address.
fn resolve_email(claims: &IdTokenClaims) -> Option<String> {
    claims
        .email
        .as_deref()
        .or(claims.preferred_username.as_deref())
        .filter(|v| v.contains('@'))
        .map(str::to_string)
}

/// Name fallback chain: `name`, `given_name family_name`, then the email.
fn resolve_display_name(claims: &IdTokenClaims, email: &str) -> String {
    if let Some(name) = claims.name.as_deref().filter(|n| !n.trim().is_empty()) {
        return name.to_string();
    }
    match (claims.given_name.as_deref(), claims.family_name.as_deref()) {
        (Some(given), Some(family)) => format!("{given} {family}"),
        (Some(given), None) => given.to_string(),
        (None, Some(family)) => family.to_string(),
        (None, None) => email.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::test_keys::{sign_claims, test_jwks_json};
    use chrono::Utc;
    use sentra_auth::InMemoryUserDirectory;
    use sentra_core::audit::RecordingAuditSink;
    use std::time::Duration;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        server: MockServer,
        directory: Arc<InMemoryUserDirectory>,
        audit: Arc<RecordingAuditSink>,
        authenticator: OidcAuthenticator,
    }

    async fn harness() -> Harness {
        let server = MockServer::start().await;
        let issuer = server.uri();

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": issuer,
                "authorization_endpoint": format!("{issuer}/authorize"),
                "token_endpoint": format!("{issuer}/token"),
                "jwks_uri": format!("{issuer}/jwks"),
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_string(test_jwks_json()))
            .mount(&server)
            .await;

        let directory = Arc::new(InMemoryUserDirectory::new());
        let audit = Arc::new(RecordingAuditSink::new());
        let authenticator =
            OidcAuthenticator::new(ProvisioningService::new(directory.clone()), audit.clone())
                .with_caches(
                    DiscoveryCache::new(Duration::from_secs(3600)).allow_http(true),
                    JwksCache::new(Duration::from_secs(900)),
                );

        Harness {
            server,
            directory,
            audit,
            authenticator,
        }
    }

    fn provider(issuer: &str, driver: &str) -> IdentityProvider {
        let mut provider = IdentityProvider::default_for_test();
        provider.key = "corp-oidc".to_string();
        provider.driver = driver.to_string();
        provider.config = json!({
            "issuer": issuer,
            "client_id": "my-client",
            "client_secret": "s3cret",
            "create_users": true,
        });
        provider
    }

    fn claims(issuer: &str) -> serde_json::Value {
        json!({
            "sub": "subject-1",
            "iss": issuer,
            "aud": "my-client",
            "exp": Utc::now().timestamp() + 600,
            "email": "jane@example.com",
            "name": "Jane Doe",
        })
    }

    fn login(token: &str) -> OidcLogin<'_> {
        OidcLogin {
            grant: OidcGrant::IdToken(token),
            nonce: None,
            ip: Some("203.0.113.9"),
            user_agent: Some("Mozilla/5.0"),
        }
    }

    #[tokio::test]
    async fn test_id_token_login_provisions_user() {
        let h = harness().await;
        let issuer = h.server.uri();
        let token = sign_claims(&claims(&issuer));

        let user = h
            .authenticator
            .authenticate(&provider(&issuer, "oidc"), login(&token))
            .await
            .unwrap();

        assert_eq!(user.email, "jane@example.com");
        assert_eq!(user.subject, "subject-1");
        assert_eq!(user.user.display_name.as_deref(), Some("Jane Doe"));
        assert!(user.created);
        assert_eq!(h.directory.user_count().await, 1);
        assert_eq!(h.audit.actions().await, vec![actions::OIDC_LOGIN]);
    }

    #[tokio::test]
    async fn test_code_exchange_login() {
        let h = harness().await;
        let issuer = h.server.uri();
        let token = sign_claims(&claims(&issuer));

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at",
                "id_token": token,
                "token_type": "Bearer",
            })))
            .mount(&h.server)
            .await;

        let user = h
            .authenticator
            .authenticate(
                &provider(&issuer, "oidc"),
                OidcLogin {
                    grant: OidcGrant::Code {
                        code: "auth-code",
                        redirect_uri: "https://app.example.com/callback",
                        code_verifier: Some("pkce-verifier"),
                    },
                    nonce: None,
                    ip: None,
                    user_agent: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(user.email, "jane@example.com");
    }

    #[tokio::test]
    async fn test_failed_login_audits_failure() {
        let h = harness().await;
        let issuer = h.server.uri();
        let mut bad = claims(&issuer);
        bad["aud"] = json!(["other-client"]);
        let token = sign_claims(&bad);

        let err = h
            .authenticator
            .authenticate(&provider(&issuer, "oidc"), login(&token))
            .await
            .unwrap_err();

        assert!(matches!(err, OidcError::InvalidAudience));
        assert_eq!(h.audit.actions().await, vec![actions::OIDC_LOGIN_FAILED]);
        assert_eq!(h.directory.user_count().await, 0);
    }

    #[tokio::test]
    async fn test_email_falls_back_to_preferred_username() {
        let h = harness().await;
        let issuer = h.server.uri();
        let mut c = claims(&issuer);
        c.as_object_mut().unwrap().remove("email");
        c["preferred_username"] = json!("jane.doe@example.com");
        let token = sign_claims(&c);

        let user = h
            .authenticator
            .authenticate(&provider(&issuer, "oidc"), login(&token))
            .await
            .unwrap();
        assert_eq!(user.email, "jane.doe@example.com");
    }

    #[tokio::test]
    async fn test_missing_email_rejected() {
        let h = harness().await;
        let issuer = h.server.uri();
        let mut c = claims(&issuer);
        c.as_object_mut().unwrap().remove("email");
        c["preferred_username"] = json!("jane.doe"); // not an address
        let token = sign_claims(&c);

        let err = h
            .authenticator
            .authenticate(&provider(&issuer, "oidc"), login(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, OidcError::MissingClaim("email")));
    }

    #[tokio::test]
    async fn test_role_templates_from_groups_claim() {
        let h = harness().await;
        let issuer = h.server.uri();
        let role = Uuid::new_v4();
        h.directory.add_role(role).await;

        let mut p = provider(&issuer, "oidc");
        p.config["role_templates"] = json!([
            {"claim": "groups", "values": ["grc-admins"], "roles": [role.to_string()]}
        ]);

        let mut c = claims(&issuer);
        c["groups"] = json!(["engineers", "grc-admins"]);
        let token = sign_claims(&c);

        let user = h.authenticator.authenticate(&p, login(&token)).await.unwrap();
        assert_eq!(user.roles, vec![role]);
    }

    #[test]
    fn test_entra_issuer_derived_from_tenant() {
        let mut provider = IdentityProvider::default_for_test();
        provider.driver = "entra".to_string();
        provider.config = json!({
            "tenant_id": "11111111-2222-3333-4444-555555555555",
            "client_id": "app-id",
            "client_secret": "s3cret",
        });

        let settings = OidcSettings::from_provider(&provider).unwrap();
        assert_eq!(
            settings.issuer,
            "https://login.microsoftonline.com/11111111-2222-3333-4444-555555555555/v2.0"
        );
    }

    #[test]
    fn test_entra_explicit_issuer_wins() {
        let mut provider = IdentityProvider::default_for_test();
        provider.driver = "entra".to_string();
        provider.config = json!({
            "issuer": "https://login.microsoftonline.com/tenant/v2.0/",
            "client_id": "app-id",
            "client_secret": "s3cret",
        });

        let settings = OidcSettings::from_provider(&provider).unwrap();
        assert_eq!(
            settings.issuer,
            "https://login.microsoftonline.com/tenant/v2.0"
        );
    }

    #[test]
    fn test_missing_configuration_keys() {
        let mut provider = IdentityProvider::default_for_test();
        provider.driver = "oidc".to_string();
        provider.config = json!({"client_id": "x", "client_secret": "y"});
        assert!(matches!(
            OidcSettings::from_provider(&provider),
            Err(OidcError::InvalidConfiguration(_))
        ));

        provider.driver = "saml".to_string();
        assert!(matches!(
            OidcSettings::from_provider(&provider),
            Err(OidcError::WrongDriver(_))
        ));
    }
}
