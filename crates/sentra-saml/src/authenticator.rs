//! SAML login flows: outbound initiation and ACS callback validation.

use crate::attributes::{claim_map, resolve_display_name, resolve_email};
use crate::authn_request::{deflate_base64, redirect_query, AuthnRequestBuilder};
use crate::error::{SamlError, SamlResult};
use crate::metadata::IdpMetadataCache;
use crate::response::{decode_response, parse_response, validate_response, ValidationParams};
use crate::signature::{verify_response_signature, SigningCredentials};
use chrono::Utc;
use sentra_auth::{
    resolve_roles, AuthenticatedUser, ClientBinding, JitSettings, ProvisioningService,
    StateTokenFactory,
};
use sentra_core::audit::{self, actions, AuditEvent, AuditSink};
use sentra_db::models::identity_provider::{IdentityProvider, ProviderDriver};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

/// Inbound ACS callback.
#[derive(Debug, Clone)]
pub struct SamlCallback<'a> {
    /// Base64-encoded `SAMLResponse` from the POST body.
    pub saml_response: &'a str,
    /// Signed state token carried through `RelayState`.
    pub relay_state: Option<&'a str>,
    /// Expected `InResponseTo`, when the caller tracked it out of band.
    pub expected_request_id: Option<&'a str>,
    pub ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// Outcome of a successful callback.
#[derive(Debug, Clone)]
pub struct SamlAuthSuccess {
    pub user: AuthenticatedUser,
    /// Path the user originally asked for, recovered from the state token.
    pub intended_path: Option<String>,
}

/// Outbound login redirect material.
#[derive(Debug, Clone)]
pub struct SamlLoginRedirect {
    pub request_id: String,
    pub redirect_url: String,
    pub relay_state: Option<String>,
}

/// SAML federation authenticator (SP side).
pub struct SamlAuthenticator {
    sp_entity_id: String,
    acs_url: String,
    state_tokens: Option<Arc<StateTokenFactory>>,
    credentials: Option<Arc<SigningCredentials>>,
    metadata: IdpMetadataCache,
    provisioning: ProvisioningService,
    audit: Arc<dyn AuditSink>,
}

impl SamlAuthenticator {
    #[must_use]
    pub fn new(
        sp_entity_id: impl Into<String>,
        acs_url: impl Into<String>,
        provisioning: ProvisioningService,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            sp_entity_id: sp_entity_id.into(),
            acs_url: acs_url.into(),
            state_tokens: None,
            credentials: None,
            metadata: IdpMetadataCache::default(),
            provisioning,
            audit,
        }
    }

    /// Enable signed relay-state tokens with replay protection.
    #[must_use]
    pub fn with_state_tokens(mut self, factory: Arc<StateTokenFactory>) -> Self {
        self.state_tokens = Some(factory);
        self
    }

    /// Enable redirect-query signing with the SP key pair.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<SigningCredentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_metadata_cache(mut self, metadata: IdpMetadataCache) -> Self {
        self.metadata = metadata;
        self
    }

    /// Build the redirect that starts an SP-initiated login.
    #[instrument(skip(self, provider), fields(provider_key = %provider.key))]
    pub async fn begin_login(
        &self,
        provider: &IdentityProvider,
        intended_path: Option<&str>,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> SamlResult<SamlLoginRedirect> {
        self.assert_driver(provider)?;
        let sso_url = self.resolve_sso_url(provider).await?;

        let (request_id, relay_state) = match &self.state_tokens {
            Some(factory) => {
                let signed = factory
                    .issue(
                        provider.id,
                        &provider.key,
                        intended_path,
                        client_binding(ip, user_agent),
                    )
                    .await?;
                (signed.descriptor.request_id, Some(signed.token))
            }
            None => (StateTokenFactory::generate_request_id(), None),
        };

        let built =
            AuthnRequestBuilder::new(self.sp_entity_id.as_str(), self.acs_url.as_str(), sso_url.as_str())
                .build(&request_id);
        let deflated = deflate_base64(&built.xml)?;
        let query = redirect_query(
            &deflated,
            relay_state.as_deref(),
            self.credentials.as_deref(),
        )?;

        let separator = if sso_url.contains('?') { '&' } else { '?' };
        Ok(SamlLoginRedirect {
            request_id,
            redirect_url: format!("{sso_url}{separator}{query}"),
            relay_state,
        })
    }

    /// Validate an ACS callback and provision the user.
    #[instrument(skip(self, provider, callback), fields(provider_key = %provider.key))]
    pub async fn authenticate(
        &self,
        provider: &IdentityProvider,
        callback: SamlCallback<'_>,
    ) -> SamlResult<SamlAuthSuccess> {
        let result = self.run(provider, &callback).await;

        match &result {
            Ok(success) => {
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::new(actions::SAML_LOGIN)
                        .actor(success.user.user.id)
                        .entity("identity_provider", provider.key.clone())
                        .client(callback.ip, callback.user_agent)
                        .meta(json!({
                            "provider_key": provider.key,
                            "subject": success.user.subject,
                        })),
                )
                .await;
            }
            Err(e) => {
                let errors = match e {
                    SamlError::ValidationFailed(reasons) => reasons.clone(),
                    other => vec![other.to_string()],
                };
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::new(actions::LOGIN_FAILED)
                        .entity("identity_provider", provider.key.clone())
                        .client(callback.ip, callback.user_agent)
                        .meta(json!({
                            "provider_key": provider.key,
                            "driver": "saml",
                            "errors": errors,
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
        callback: &SamlCallback<'_>,
    ) -> SamlResult<SamlAuthSuccess> {
        self.assert_driver(provider)?;
        let certificate = self.resolve_certificate(provider).await?;

        let xml = decode_response(callback.saml_response)?;

        // Signature first; nothing in the document is trusted before this.
        verify_response_signature(&xml, &certificate)?;

        let parsed = parse_response(&xml)?;

        // Relay-state validation consumes the replay marker exactly once.
        let mut intended_path = None;
        let mut expected_request_id = callback.expected_request_id.map(str::to_string);
        if let (Some(relay_state), Some(factory)) = (callback.relay_state, &self.state_tokens) {
            let descriptor = factory
                .validate(
                    relay_state,
                    client_binding(callback.ip, callback.user_agent),
                )
                .await?;
            if descriptor.provider_key != provider.key {
                return Err(SamlError::StateProviderMismatch);
            }
            intended_path = descriptor.intended_path;
            if expected_request_id.is_none() {
                expected_request_id = Some(descriptor.request_id);
            }
        }

        validate_response(
            &parsed,
            &ValidationParams {
                acs_url: &self.acs_url,
                sp_entity_id: &self.sp_entity_id,
                expected_request_id: expected_request_id.as_deref(),
                now: Utc::now(),
            },
        )
        .map_err(SamlError::ValidationFailed)?;

        let claims = claim_map(&parsed.assertion);
        let email = resolve_email(&claims).ok_or(SamlError::NoEmailClaim)?;
        let display_name =
            resolve_display_name(&claims, provider.config_str("name_attribute"), &email);

        let jit = JitSettings::from_config(&provider.config)?;
        let roles = resolve_roles(&jit, &claims);

        let provisioned = self
            .provisioning
            .provision(&jit, &email, Some(&display_name), &roles)
            .await?;

        let subject = parsed
            .assertion
            .name_id
            .clone()
            .unwrap_or_else(|| email.clone());

        Ok(SamlAuthSuccess {
            user: AuthenticatedUser {
                user: provisioned.user,
                roles: provisioned.roles,
                created: provisioned.created,
                provider_key: provider.key.clone(),
                subject,
                email,
            },
            intended_path,
        })
    }

    fn assert_driver(&self, provider: &IdentityProvider) -> SamlResult<()> {
        match provider.parsed_driver() {
            Ok(ProviderDriver::Saml) => Ok(()),
            _ => Err(SamlError::WrongDriver(provider.driver.clone())),
        }
    }

    /// Certificate from the provider config, falling back to published
    /// metadata when a metadata URL is configured instead.
    async fn resolve_certificate(&self, provider: &IdentityProvider) -> SamlResult<String> {
        if let Some(certificate) = provider.config_str("certificate") {
            return Ok(certificate.to_string());
        }
        if let Some(url) = provider.config_str("metadata_url") {
            if let Some(certificate) = self.metadata.get(url).await?.certificate {
                return Ok(certificate);
            }
        }
        Err(SamlError::MissingCertificate)
    }

    async fn resolve_sso_url(&self, provider: &IdentityProvider) -> SamlResult<String> {
        if let Some(sso_url) = provider.config_str("sso_url") {
            return Ok(sso_url.to_string());
        }
        if let Some(url) = provider.config_str("metadata_url") {
            let metadata = self.metadata.get(url).await?;
            if let Some(sso_url) = metadata.sso_redirect_url.or(metadata.sso_post_url) {
                return Ok(sso_url);
            }
        }
        Err(SamlError::Metadata(
            "provider has no SSO URL configured or published".to_string(),
        ))
    }
}

fn client_binding<'a>(
    ip: Option<&'a str>,
    user_agent: Option<&'a str>,
) -> Option<ClientBinding<'a>> {
    if ip.is_none() && user_agent.is_none() {
        return None;
    }
    Some(ClientBinding {
        ip: ip.unwrap_or(""),
        user_agent: user_agent.unwrap_or(""),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authn_request::{inflate_base64, parse_authn_request};
    use crate::signature::{sign_enveloped, test_identity};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use chrono::Duration as ChronoDuration;
    use sentra_auth::{InMemoryUserDirectory, ReplayGuard, StateKeys};
    use sentra_core::audit::RecordingAuditSink;
    use sentra_core::cache::InMemoryCache;
    use std::time::Duration;
    use uuid::Uuid;

    const SP_ENTITY_ID: &str = "https://grc.example.com/saml/metadata";
    const ACS_URL: &str = "https://grc.example.com/saml/acs";

    struct Harness {
        directory: Arc<InMemoryUserDirectory>,
        audit: Arc<RecordingAuditSink>,
        authenticator: SamlAuthenticator,
        certificate_pem: String,
        signing_key_pem: Vec<u8>,
    }

    fn harness() -> Harness {
        let (key, cert) = test_identity::generate();
        let directory = Arc::new(InMemoryUserDirectory::new());
        let audit = Arc::new(RecordingAuditSink::new());

        let replay = ReplayGuard::new(Arc::new(InMemoryCache::new()), Duration::from_secs(300));
        let factory = StateTokenFactory::new(
            StateKeys::new(b"saml-state-signing-key-32-bytes!".as_slice()),
            SP_ENTITY_ID,
            ACS_URL,
            300,
            replay,
        );

        let authenticator = SamlAuthenticator::new(
            SP_ENTITY_ID,
            ACS_URL,
            ProvisioningService::new(directory.clone()),
            audit.clone(),
        )
        .with_state_tokens(Arc::new(factory));

        Harness {
            directory,
            audit,
            authenticator,
            certificate_pem: cert,
            signing_key_pem: key,
        }
    }

    fn provider(certificate: &str) -> IdentityProvider {
        let mut provider = IdentityProvider::default_for_test();
        provider.key = "okta-saml".to_string();
        provider.driver = "saml".to_string();
        provider.config = json!({
            "certificate": certificate,
            "sso_url": "https://idp.example.com/sso",
            "create_users": true,
        });
        provider
    }

    fn response_xml(audience: &str, in_response_to: Option<&str>, minutes_valid: i64) -> String {
        let now = Utc::now();
        let irt = in_response_to
            .map(|id| format!(" InResponseTo=\"{id}\""))
            .unwrap_or_default();
        format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_resp1" Version="2.0" Destination="{ACS_URL}"{irt}><saml:Issuer>https://idp.example.com</saml:Issuer><saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_assert1" Version="2.0"><saml:Issuer>https://idp.example.com</saml:Issuer><saml:Subject><saml:NameID>jane@example.com</saml:NameID></saml:Subject><saml:Conditions NotBefore="{nb}" NotOnOrAfter="{noa}"><saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction></saml:Conditions><saml:AttributeStatement><saml:Attribute Name="displayName"><saml:AttributeValue>Jane Doe</saml:AttributeValue></saml:Attribute><saml:Attribute Name="groups"><saml:AttributeValue>Auditors</saml:AttributeValue></saml:Attribute></saml:AttributeStatement></saml:Assertion></samlp:Response>"#,
            nb = (now - ChronoDuration::minutes(2)).to_rfc3339(),
            noa = (now + ChronoDuration::minutes(minutes_valid)).to_rfc3339(),
        )
    }

    fn signed_callback_payload(h: &Harness, xml: &str) -> String {
        let credentials =
            SigningCredentials::from_pem(&h.signing_key_pem, h.certificate_pem.as_bytes())
                .unwrap();
        let signed = sign_enveloped(xml, "_assert1", &credentials).unwrap();
        STANDARD.encode(signed)
    }

    fn callback(payload: &str) -> SamlCallback<'_> {
        SamlCallback {
            saml_response: payload,
            relay_state: None,
            expected_request_id: None,
            ip: Some("203.0.113.9"),
            user_agent: Some("Mozilla/5.0"),
        }
    }

    #[tokio::test]
    async fn test_successful_login() {
        let h = harness();
        let payload = signed_callback_payload(&h, &response_xml(SP_ENTITY_ID, None, 5));

        let success = h
            .authenticator
            .authenticate(&provider(&h.certificate_pem), callback(&payload))
            .await
            .unwrap();

        assert_eq!(success.user.email, "jane@example.com");
        assert_eq!(success.user.subject, "jane@example.com");
        assert_eq!(success.user.user.display_name.as_deref(), Some("Jane Doe"));
        assert!(success.user.created);
        assert_eq!(h.directory.user_count().await, 1);
        assert_eq!(h.audit.actions().await, vec![actions::SAML_LOGIN]);
    }

    #[tokio::test]
    async fn test_full_round_trip_with_relay_state() {
        let h = harness();
        let provider = provider(&h.certificate_pem);

        let redirect = h
            .authenticator
            .begin_login(&provider, Some("/reports/42"), Some("203.0.113.9"), Some("Mozilla/5.0"))
            .await
            .unwrap();

        // The IdP answers with InResponseTo = our request id.
        let payload = signed_callback_payload(
            &h,
            &response_xml(SP_ENTITY_ID, Some(&redirect.request_id), 5),
        );
        let relay = redirect.relay_state.clone().unwrap();

        let mut cb = callback(&payload);
        cb.relay_state = Some(&relay);
        let success = h.authenticator.authenticate(&provider, cb).await.unwrap();

        assert_eq!(success.intended_path.as_deref(), Some("/reports/42"));

        // Replaying the same relay state must fail.
        let mut cb = callback(&payload);
        cb.relay_state = Some(&relay);
        let err = h.authenticator.authenticate(&provider, cb).await.unwrap_err();
        assert!(matches!(
            err,
            SamlError::Auth(sentra_auth::AuthError::Replayed(_))
        ));
    }

    #[tokio::test]
    async fn test_begin_login_emits_parseable_request() {
        let h = harness();
        let redirect = h
            .authenticator
            .begin_login(&provider(&h.certificate_pem), None, None, None)
            .await
            .unwrap();

        assert!(redirect.redirect_url.starts_with("https://idp.example.com/sso?"));

        let query = redirect.redirect_url.split('?').nth(1).unwrap();
        let saml_request = query
            .split('&')
            .find_map(|pair| pair.strip_prefix("SAMLRequest="))
            .unwrap();
        let decoded = urlencoding::decode(saml_request).unwrap();
        let xml = inflate_base64(&decoded).unwrap();
        let parsed = parse_authn_request(&xml).unwrap();

        assert_eq!(parsed.id, redirect.request_id);
        assert_eq!(parsed.issuer, SP_ENTITY_ID);
        assert_eq!(parsed.destination.as_deref(), Some("https://idp.example.com/sso"));
        assert_eq!(parsed.assertion_consumer_service_url.as_deref(), Some(ACS_URL));
    }

    #[tokio::test]
    async fn test_tampered_response_rejected() {
        let h = harness();
        let payload = signed_callback_payload(&h, &response_xml(SP_ENTITY_ID, None, 5));
        let tampered = STANDARD.encode(
            String::from_utf8(STANDARD.decode(&payload).unwrap())
                .unwrap()
                .replace("jane@example.com", "mallory@example.com"),
        );

        let err = h
            .authenticator
            .authenticate(&provider(&h.certificate_pem), callback(&tampered))
            .await
            .unwrap_err();
        assert!(matches!(err, SamlError::SignatureInvalid(_)));
        assert_eq!(h.audit.actions().await, vec![actions::LOGIN_FAILED]);
        assert_eq!(h.directory.user_count().await, 0);
    }

    #[tokio::test]
    async fn test_wrong_audience_rejected_despite_valid_signature() {
        let h = harness();
        let payload =
            signed_callback_payload(&h, &response_xml("https://other-sp.example.com", None, 5));

        let err = h
            .authenticator
            .authenticate(&provider(&h.certificate_pem), callback(&payload))
            .await
            .unwrap_err();
        assert!(matches!(err, SamlError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_expired_assertion_rejected() {
        let h = harness();
        // NotOnOrAfter ~ 200 seconds in the past.
        let payload = signed_callback_payload(&h, &response_xml(SP_ENTITY_ID, None, -4));

        let err = h
            .authenticator
            .authenticate(&provider(&h.certificate_pem), callback(&payload))
            .await
            .unwrap_err();
        assert!(matches!(err, SamlError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_in_response_to_mismatch() {
        let h = harness();
        let payload =
            signed_callback_payload(&h, &response_xml(SP_ENTITY_ID, Some("_spoofed"), 5));

        let mut cb = callback(&payload);
        cb.expected_request_id = Some("_the_real_request");
        let err = h
            .authenticator
            .authenticate(&provider(&h.certificate_pem), cb)
            .await
            .unwrap_err();
        assert!(matches!(err, SamlError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_relay_state_for_other_provider_rejected() {
        let h = harness();
        let provider_a = provider(&h.certificate_pem);

        let redirect = h
            .authenticator
            .begin_login(&provider_a, None, None, None)
            .await
            .unwrap();
        let relay = redirect.relay_state.unwrap();

        let mut provider_b = provider(&h.certificate_pem);
        provider_b.key = "other-saml".to_string();

        let payload = signed_callback_payload(
            &h,
            &response_xml(SP_ENTITY_ID, Some(&redirect.request_id), 5),
        );
        let mut cb = callback(&payload);
        cb.relay_state = Some(&relay);

        let err = h
            .authenticator
            .authenticate(&provider_b, cb)
            .await
            .unwrap_err();
        assert!(matches!(err, SamlError::StateProviderMismatch));
    }

    #[tokio::test]
    async fn test_missing_certificate_is_config_error() {
        let h = harness();
        let mut p = provider(&h.certificate_pem);
        p.config = json!({"sso_url": "https://idp.example.com/sso"});

        let payload = signed_callback_payload(&h, &response_xml(SP_ENTITY_ID, None, 5));
        let err = h.authenticator.authenticate(&p, callback(&payload)).await.unwrap_err();
        assert!(matches!(err, SamlError::MissingCertificate));
    }

    #[tokio::test]
    async fn test_wrong_driver() {
        let h = harness();
        let mut p = provider(&h.certificate_pem);
        p.driver = "oidc".to_string();

        let payload = signed_callback_payload(&h, &response_xml(SP_ENTITY_ID, None, 5));
        let err = h.authenticator.authenticate(&p, callback(&payload)).await.unwrap_err();
        assert!(matches!(err, SamlError::WrongDriver(_)));
    }

    #[tokio::test]
    async fn test_role_template_from_assertion_groups() {
        let h = harness();
        let role = Uuid::new_v4();
        h.directory.add_role(role).await;

        let mut p = provider(&h.certificate_pem);
        p.config["role_templates"] = json!([
            {"claim": "groups", "values": ["Auditors"], "roles": [role.to_string()]}
        ]);

        let payload = signed_callback_payload(&h, &response_xml(SP_ENTITY_ID, None, 5));
        let success = h.authenticator.authenticate(&p, callback(&payload)).await.unwrap();
        assert_eq!(success.user.roles, vec![role]);
    }
}
