//! SP metadata generation and IdP metadata consumption.

use crate::error::{SamlError, SamlResult};
use crate::signature::SigningCredentials;
use crate::xml::xml_escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Default TTL for cached IdP metadata (1 hour).
pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(3600);

/// Build the SP `EntityDescriptor` document published to IdPs.
///
/// Carries the ACS endpoint (HTTP-POST binding) and, when credentials are
/// supplied, the signing certificate so IdPs can verify redirect
/// signatures.
pub fn build_sp_metadata(
    sp_entity_id: &str,
    acs_url: &str,
    credentials: Option<&SigningCredentials>,
) -> SamlResult<String> {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<md:EntityDescriptor xmlns:md=\"urn:oasis:names:tc:SAML:2.0:metadata\" entityID=\"");
    xml.push_str(&xml_escape(sp_entity_id));
    xml.push_str("\">\n");
    xml.push_str("    <md:SPSSODescriptor AuthnRequestsSigned=\"");
    xml.push_str(if credentials.is_some() { "true" } else { "false" });
    xml.push_str("\" WantAssertionsSigned=\"true\" protocolSupportEnumeration=\"urn:oasis:names:tc:SAML:2.0:protocol\">\n");

    if let Some(credentials) = credentials {
        let certificate = credentials.certificate_base64_der()?;
        xml.push_str("        <md:KeyDescriptor use=\"signing\">\n");
        xml.push_str("            <ds:KeyInfo xmlns:ds=\"http://www.w3.org/2000/09/xmldsig#\">\n");
        xml.push_str("                <ds:X509Data>\n");
        xml.push_str("                    <ds:X509Certificate>");
        xml.push_str(&certificate);
        xml.push_str("</ds:X509Certificate>\n");
        xml.push_str("                </ds:X509Data>\n");
        xml.push_str("            </ds:KeyInfo>\n");
        xml.push_str("        </md:KeyDescriptor>\n");
    }

    xml.push_str("        <md:NameIDFormat>urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress</md:NameIDFormat>\n");
    xml.push_str("        <md:AssertionConsumerService Binding=\"urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST\" Location=\"");
    xml.push_str(&xml_escape(acs_url));
    xml.push_str("\" index=\"0\" isDefault=\"true\"/>\n");
    xml.push_str("    </md:SPSSODescriptor>\n");
    xml.push_str("</md:EntityDescriptor>");

    Ok(xml)
}

/// What we consume from an IdP's published metadata.
#[derive(Debug, Clone, Default)]
pub struct IdpMetadata {
    pub entity_id: String,
    pub sso_redirect_url: Option<String>,
    pub sso_post_url: Option<String>,
    pub slo_url: Option<String>,
    /// Signing certificate, base64 DER as published.
    pub certificate: Option<String>,
}

const REDIRECT_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";
const POST_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";

/// Parse an IdP `EntityDescriptor` document.
pub fn parse_idp_metadata(xml: &str) -> SamlResult<IdpMetadata> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut metadata = IdpMetadata::default();
    let mut in_idp_descriptor = false;
    let mut in_signing_key = false;
    let mut in_certificate = false;
    let mut certificate = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e) | Event::Empty(e)) => {
                let local_name = e.local_name();
                let name = std::str::from_utf8(local_name.as_ref()).unwrap_or("");

                match name {
                    "EntityDescriptor" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"entityID" {
                                metadata.entity_id =
                                    attr.unescape_value().unwrap_or_default().to_string();
                            }
                        }
                    }
                    "IDPSSODescriptor" => in_idp_descriptor = true,
                    "KeyDescriptor" if in_idp_descriptor => {
                        // `use` defaults to both signing and encryption.
                        let mut use_value = None;
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"use" {
                                use_value =
                                    Some(attr.unescape_value().unwrap_or_default().to_string());
                            }
                        }
                        in_signing_key =
                            use_value.is_none() || use_value.as_deref() == Some("signing");
                    }
                    "X509Certificate" if in_signing_key => in_certificate = true,
                    "SingleSignOnService" if in_idp_descriptor => {
                        let mut binding = None;
                        let mut location = None;
                        for attr in e.attributes().flatten() {
                            let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
                            let value = attr.unescape_value().unwrap_or_default().to_string();
                            match key {
                                "Binding" => binding = Some(value),
                                "Location" => location = Some(value),
                                _ => {}
                            }
                        }
                        match binding.as_deref() {
                            Some(REDIRECT_BINDING) => metadata.sso_redirect_url = location,
                            Some(POST_BINDING) => metadata.sso_post_url = location,
                            _ => {}
                        }
                    }
                    "SingleLogoutService" if in_idp_descriptor => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"Location" {
                                metadata.slo_url =
                                    Some(attr.unescape_value().unwrap_or_default().to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if in_certificate {
                    certificate.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(e)) => {
                let local_name = e.local_name();
                let name = std::str::from_utf8(local_name.as_ref()).unwrap_or("");
                match name {
                    "IDPSSODescriptor" => in_idp_descriptor = false,
                    "KeyDescriptor" => in_signing_key = false,
                    "X509Certificate" => {
                        if in_certificate && metadata.certificate.is_none() {
                            metadata.certificate =
                                Some(certificate.split_whitespace().collect::<String>());
                        }
                        in_certificate = false;
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SamlError::Metadata(format!("XML parse error: {e}")));
            }
            _ => {}
        }
    }

    if metadata.entity_id.is_empty() {
        return Err(SamlError::Metadata(
            "metadata carries no entityID".to_string(),
        ));
    }

    Ok(metadata)
}

#[derive(Debug, Clone)]
struct CachedMetadata {
    metadata: IdpMetadata,
    fetched_at: Instant,
}

/// Time-boxed cache of fetched IdP metadata documents, keyed by URL.
#[derive(Clone)]
pub struct IdpMetadataCache {
    cache: Arc<RwLock<HashMap<String, CachedMetadata>>>,
    ttl: Duration,
    http: reqwest::Client,
}

impl IdpMetadataCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            http: sentra_core::http::outbound_client(),
        }
    }

    /// Fetch (or reuse) the parsed metadata behind a URL.
    #[instrument(skip(self))]
    pub async fn get(&self, metadata_url: &str) -> SamlResult<IdpMetadata> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(metadata_url) {
                if cached.fetched_at.elapsed() < self.ttl {
                    debug!(url = %metadata_url, "IdP metadata cache hit");
                    return Ok(cached.metadata.clone());
                }
            }
        }

        debug!(url = %metadata_url, "IdP metadata cache miss, fetching");
        let response = self
            .http
            .get(metadata_url)
            .send()
            .await
            .map_err(|e| SamlError::Metadata(format!("HTTP error: {e}")))?;

        if !response.status().is_success() {
            return Err(SamlError::Metadata(format!(
                "HTTP status {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SamlError::Metadata(format!("body read error: {e}")))?;
        let metadata = parse_idp_metadata(&body)?;

        let mut cache = self.cache.write().await;
        cache.insert(
            metadata_url.to_string(),
            CachedMetadata {
                metadata: metadata.clone(),
                fetched_at: Instant::now(),
            },
        );

        info!(url = %metadata_url, entity_id = %metadata.entity_id, "IdP metadata cached");
        Ok(metadata)
    }

    /// Drop a cached document.
    pub async fn invalidate(&self, metadata_url: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(metadata_url);
    }
}

impl Default for IdpMetadataCache {
    fn default() -> Self {
        Self::new(DEFAULT_METADATA_TTL)
    }
}
