//! Outbound `AuthnRequest` construction and binding codecs.
//!
//! Requests are built as strings the same way the rest of the SAML XML in
//! this crate is, deflated+base64 encoded for the redirect binding, and
//! optionally signed at the query level with RSA-SHA256. The parser exists
//! for self-verification and diagnostics: what we emit must round-trip.

use crate::error::{SamlError, SamlResult};
use crate::signature::{sign_redirect_query, SigningCredentials, RSA_SHA256_URI};
use crate::xml::xml_escape;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{Read, Write};

/// Decompressed size cap for inbound deflate payloads (64 KB).
const MAX_DECOMPRESSED_SIZE: u64 = 64 * 1024;

/// Encoded size cap for redirect-binding payloads (128 KB).
const MAX_ENCODED_SIZE: usize = 128 * 1024;

/// A constructed `AuthnRequest`.
#[derive(Debug, Clone)]
pub struct BuiltAuthnRequest {
    pub id: String,
    pub issue_instant: DateTime<Utc>,
    pub xml: String,
}

/// Builder for SP-initiated `AuthnRequest` messages.
#[derive(Debug, Clone)]
pub struct AuthnRequestBuilder {
    sp_entity_id: String,
    acs_url: String,
    /// The IdP's SSO endpoint.
    destination: String,
    is_passive: bool,
    force_authn: bool,
}

impl AuthnRequestBuilder {
    #[must_use]
    pub fn new(
        sp_entity_id: impl Into<String>,
        acs_url: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            sp_entity_id: sp_entity_id.into(),
            acs_url: acs_url.into(),
            destination: destination.into(),
            is_passive: false,
            force_authn: false,
        }
    }

    #[must_use]
    pub fn passive(mut self, is_passive: bool) -> Self {
        self.is_passive = is_passive;
        self
    }

    #[must_use]
    pub fn force_authn(mut self, force: bool) -> Self {
        self.force_authn = force;
        self
    }

    /// Build the request XML under the given request id.
    ///
    /// The id is issued by the state-token factory so the replay marker and
    /// the `InResponseTo` check share one identifier.
    #[must_use]
    pub fn build(&self, request_id: &str) -> BuiltAuthnRequest {
        let issue_instant = Utc::now();
        let instant_str = issue_instant.format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str("<samlp:AuthnRequest xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\"\n");
        xml.push_str("    xmlns:saml=\"urn:oasis:names:tc:SAML:2.0:assertion\"\n");
        xml.push_str("    ID=\"");
        xml.push_str(&xml_escape(request_id));
        xml.push_str("\"\n    Version=\"2.0\"\n    IssueInstant=\"");
        xml.push_str(&instant_str);
        xml.push_str("\"\n    Destination=\"");
        xml.push_str(&xml_escape(&self.destination));
        xml.push_str("\"\n    AssertionConsumerServiceURL=\"");
        xml.push_str(&xml_escape(&self.acs_url));
        xml.push_str("\"\n    ProtocolBinding=\"urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST\"");
        if self.is_passive {
            xml.push_str("\n    IsPassive=\"true\"");
        }
        if self.force_authn {
            xml.push_str("\n    ForceAuthn=\"true\"");
        }
        xml.push_str(">\n    <saml:Issuer>");
        xml.push_str(&xml_escape(&self.sp_entity_id));
        xml.push_str("</saml:Issuer>\n");
        xml.push_str("    <samlp:NameIDPolicy Format=\"urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress\" AllowCreate=\"true\"/>\n");
        xml.push_str("</samlp:AuthnRequest>");

        BuiltAuthnRequest {
            id: request_id.to_string(),
            issue_instant,
            xml,
        }
    }
}

/// Encode for the redirect binding: raw deflate, then base64.
pub fn deflate_base64(xml: &str) -> SamlResult<String> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .map_err(|e| SamlError::RequestBuildFailed(format!("deflate failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| SamlError::RequestBuildFailed(format!("deflate failed: {e}")))?;
    Ok(STANDARD.encode(compressed))
}

/// Decode a redirect-binding payload: base64, then inflate, with caps on
/// both the encoded and decompressed sizes.
pub fn inflate_base64(encoded: &str) -> SamlResult<String> {
    if encoded.len() > MAX_ENCODED_SIZE {
        return Err(SamlError::ResponseTooLarge);
    }

    let compressed = STANDARD
        .decode(encoded)
        .map_err(|e| SamlError::MalformedResponse(format!("base64 decode failed: {e}")))?;

    let decoder = DeflateDecoder::new(&compressed[..]);
    let mut xml = String::new();
    decoder
        .take(MAX_DECOMPRESSED_SIZE)
        .read_to_string(&mut xml)
        .map_err(|e| SamlError::MalformedResponse(format!("deflate decode failed: {e}")))?;

    if xml.len() as u64 >= MAX_DECOMPRESSED_SIZE {
        return Err(SamlError::ResponseTooLarge);
    }

    Ok(xml)
}

/// Build the redirect query string carrying `SAMLRequest`, `RelayState`,
/// and, when credentials are supplied, `SigAlg` + `Signature`.
pub fn redirect_query(
    deflated_request: &str,
    relay_state: Option<&str>,
    credentials: Option<&SigningCredentials>,
) -> SamlResult<String> {
    let request_encoded = urlencoding::encode(deflated_request).to_string();
    let relay_encoded = relay_state.map(|rs| urlencoding::encode(rs).to_string());

    let mut query = format!("SAMLRequest={request_encoded}");
    if let Some(relay) = &relay_encoded {
        query.push_str("&RelayState=");
        query.push_str(relay);
    }

    if let Some(credentials) = credentials {
        let sig_alg_encoded = urlencoding::encode(RSA_SHA256_URI).to_string();
        let signature = sign_redirect_query(
            credentials,
            &request_encoded,
            relay_encoded.as_deref(),
            &sig_alg_encoded,
        )?;
        query.push_str("&SigAlg=");
        query.push_str(&sig_alg_encoded);
        query.push_str("&Signature=");
        query.push_str(&urlencoding::encode(&signature));
    }

    Ok(query)
}

/// A parsed `AuthnRequest`, used to self-verify outbound construction.
#[derive(Debug, Clone)]
pub struct ParsedAuthnRequest {
    pub id: String,
    pub issuer: String,
    pub destination: Option<String>,
    pub assertion_consumer_service_url: Option<String>,
    pub is_passive: bool,
    pub force_authn: bool,
    pub issue_instant: DateTime<Utc>,
}

/// Parse an `AuthnRequest` document.
pub fn parse_authn_request(xml: &str) -> SamlResult<ParsedAuthnRequest> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut id = None;
    let mut issuer = None;
    let mut destination = None;
    let mut acs_url = None;
    let mut is_passive = false;
    let mut force_authn = false;
    let mut issue_instant_raw = None;
    let mut in_issuer = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e) | Event::Empty(e)) => {
                let local_name = e.local_name();
                let name = std::str::from_utf8(local_name.as_ref()).unwrap_or("");

                match name {
                    "AuthnRequest" => {
                        for attr in e.attributes().flatten() {
                            let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
                            let value = attr.unescape_value().unwrap_or_default().to_string();
                            match key {
                                "ID" => id = Some(value),
                                "IssueInstant" => issue_instant_raw = Some(value),
                                "Destination" => destination = Some(value),
                                "AssertionConsumerServiceURL" => acs_url = Some(value),
                                "IsPassive" => is_passive = value == "true",
                                "ForceAuthn" => force_authn = value == "true",
                                _ => {}
                            }
                        }
                    }
                    "Issuer" => in_issuer = true,
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if in_issuer {
                    issuer = Some(e.unescape().unwrap_or_default().to_string());
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"Issuer" {
                    in_issuer = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SamlError::MalformedResponse(format!("XML parse error: {e}")));
            }
            _ => {}
        }
    }

    let id = id.ok_or_else(|| {
        SamlError::MalformedResponse("AuthnRequest is missing its ID".to_string())
    })?;
    let issuer = issuer.ok_or_else(|| {
        SamlError::MalformedResponse("AuthnRequest is missing its Issuer".to_string())
    })?;
    let issue_instant_raw = issue_instant_raw.ok_or_else(|| {
        SamlError::MalformedResponse("AuthnRequest is missing IssueInstant".to_string())
    })?;
    let issue_instant = DateTime::parse_from_rfc3339(&issue_instant_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SamlError::MalformedResponse(format!("invalid IssueInstant: {e}")))?;

    Ok(ParsedAuthnRequest {
        id,
        issuer,
        destination,
        assertion_consumer_service_url: acs_url,
        is_passive,
        force_authn,
        issue_instant,
    })
}
