//! XML digital signature handling.
//!
//! Inbound: verify the signature on a `SAMLResponse` against the provider's
//! configured certificate. A valid signature may live on the root `Response`
//! or on the `Assertion`; both are tried and the first successful
//! verification wins. This is deliberately permissive for interoperability
//! with IdPs that sign only the assertion.
//!
//! Outbound: enveloped signing for POST-binding requests and RSA-SHA256
//! query signing for the redirect binding.

use crate::error::{SamlError, SamlResult};
use crate::xml::canonicalize;
use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::sign::{Signer, Verifier};
use openssl::x509::X509;
use quick_xml::events::Event;
use quick_xml::Reader;

/// Signature algorithm URI used for redirect-binding signing.
pub const RSA_SHA256_URI: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";

/// Where the accepted signature was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureLocation {
    Response,
    Assertion,
}

/// SP private key and certificate used for outbound signing.
pub struct SigningCredentials {
    private_key: PKey<Private>,
    certificate: X509,
}

impl SigningCredentials {
    /// Load from PEM-encoded key and certificate.
    pub fn from_pem(private_key_pem: &[u8], certificate_pem: &[u8]) -> SamlResult<Self> {
        let private_key = PKey::private_key_from_pem(private_key_pem)
            .map_err(|e| SamlError::Credentials(format!("invalid private key: {e}")))?;
        let certificate = X509::from_pem(certificate_pem)
            .map_err(|e| SamlError::Credentials(format!("invalid certificate: {e}")))?;
        Ok(Self {
            private_key,
            certificate,
        })
    }

    /// RSA-SHA256 signature over raw bytes.
    pub fn sign_sha256(&self, data: &[u8]) -> SamlResult<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.private_key)
            .map_err(|e| SamlError::Credentials(format!("signer creation failed: {e}")))?;
        signer
            .update(data)
            .map_err(|e| SamlError::Credentials(format!("signing failed: {e}")))?;
        signer
            .sign_to_vec()
            .map_err(|e| SamlError::Credentials(format!("signing failed: {e}")))
    }

    /// The certificate as base64 DER, for KeyInfo and metadata elements.
    pub fn certificate_base64_der(&self) -> SamlResult<String> {
        let der = self
            .certificate
            .to_der()
            .map_err(|e| SamlError::Credentials(format!("certificate DER encoding: {e}")))?;
        Ok(STANDARD.encode(der))
    }
}

/// Parse a certificate supplied either as full PEM or as bare base64 DER
/// (the form most IdP admin consoles hand out).
pub(crate) fn parse_certificate(input: &str) -> SamlResult<X509> {
    let pem = if input.contains("-----BEGIN CERTIFICATE-----") {
        input.to_string()
    } else {
        format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----",
            input.trim()
        )
    };

    X509::from_pem(pem.as_bytes())
        .map_err(|e| SamlError::InvalidCertificate(e.to_string()))
}

/// One `ds:Signature` element pulled out of a document.
struct SignatureInfo {
    signed_info: String,
    signature_value: String,
    reference_uri: String,
    digest_value: String,
}

/// Verify the document signature against the provider certificate.
///
/// Every signature element in the document is tried in order; the first one
/// whose reference digest and `SignedInfo` signature both verify decides
/// the outcome. Fails when no signature is present or none verifies.
pub fn verify_response_signature(
    xml: &str,
    certificate: &str,
) -> SamlResult<SignatureLocation> {
    let cert = parse_certificate(certificate)?;
    let public_key = cert
        .public_key()
        .map_err(|e| SamlError::InvalidCertificate(format!("no public key: {e}")))?;

    let signatures = extract_signatures(xml)?;
    if signatures.is_empty() {
        return Err(SamlError::SignatureInvalid(
            "document carries no signature".to_string(),
        ));
    }

    let mut last_error = None;
    for signature in &signatures {
        match verify_one(xml, signature, &public_key) {
            Ok(()) => {
                let location = classify_reference(xml, &signature.reference_uri);
                tracing::debug!(location = ?location, "SAML signature verified");
                return Ok(location);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        SamlError::SignatureInvalid("no signature verified".to_string())
    }))
}

/// Whether a reference points at the root `Response` or at the `Assertion`.
fn classify_reference(xml: &str, reference_uri: &str) -> SignatureLocation {
    let id = reference_uri.trim_start_matches('#');
    if id.is_empty() {
        return SignatureLocation::Response;
    }
    if let Some(assertion_pos) = find_element_start(xml, "Assertion") {
        if let Some(id_pos) = xml.find(&format!("ID=\"{id}\"")) {
            if id_pos > assertion_pos {
                return SignatureLocation::Assertion;
            }
        }
    }
    SignatureLocation::Response
}

fn find_element_start(xml: &str, local_name: &str) -> Option<usize> {
    // Match both prefixed and unprefixed forms.
    xml.find(&format!("<saml:{local_name}"))
        .or_else(|| xml.find(&format!("<{local_name}")))
        .or_else(|| xml.find(&format!("<saml2:{local_name}")))
}

fn verify_one(
    xml: &str,
    signature: &SignatureInfo,
    public_key: &PKey<Public>,
) -> SamlResult<()> {
    verify_reference_digest(xml, signature)?;

    let canonical_signed_info = canonicalize(&signature.signed_info)?;
    let signature_bytes = STANDARD
        .decode(signature.signature_value.replace(['\n', '\r', ' '], ""))
        .map_err(|e| SamlError::SignatureInvalid(format!("signature encoding: {e}")))?;

    let mut verifier = Verifier::new(MessageDigest::sha256(), public_key)
        .map_err(|e| SamlError::SignatureInvalid(format!("verifier creation: {e}")))?;
    verifier
        .update(canonical_signed_info.as_bytes())
        .map_err(|e| SamlError::SignatureInvalid(format!("verifier update: {e}")))?;

    let valid = verifier
        .verify(&signature_bytes)
        .map_err(|e| SamlError::SignatureInvalid(format!("verification: {e}")))?;

    if valid {
        Ok(())
    } else {
        Err(SamlError::SignatureInvalid(
            "signature does not match".to_string(),
        ))
    }
}

/// Check the reference digest over the canonicalized referenced element
/// with the signature stripped (enveloped transform).
fn verify_reference_digest(xml: &str, signature: &SignatureInfo) -> SamlResult<()> {
    let element_id = signature.reference_uri.trim_start_matches('#');

    let content = if element_id.is_empty() {
        xml.to_string()
    } else {
        let (start, end) = element_bounds(xml, element_id)?;
        xml[start..end].to_string()
    };

    let stripped = remove_signature_elements(&content);
    let canonical = canonicalize(&stripped)?;
    let digest = openssl::hash::hash(MessageDigest::sha256(), canonical.as_bytes())
        .map_err(|e| SamlError::SignatureInvalid(format!("digest: {e}")))?;
    let computed = STANDARD.encode(digest);

    let expected = signature.digest_value.replace(['\n', '\r', ' '], "");
    if computed != expected {
        return Err(SamlError::SignatureInvalid("digest mismatch".to_string()));
    }

    Ok(())
}

/// Byte range of the element carrying `ID="element_id"`.
fn element_bounds(xml: &str, element_id: &str) -> SamlResult<(usize, usize)> {
    let id_pattern = format!("ID=\"{element_id}\"");
    let id_pos = xml.find(&id_pattern).ok_or_else(|| {
        SamlError::SignatureInvalid(format!("referenced element not found: {element_id}"))
    })?;

    let start = xml[..id_pos].rfind('<').unwrap_or(0);
    let tag_name = extract_tag_name(&xml[start..]);
    let close_tag = format!("</{tag_name}");
    let end = xml[start..]
        .find(&close_tag)
        .map(|pos| start + pos + close_tag.len() + 1)
        .ok_or_else(|| SamlError::SignatureInvalid("element end not found".to_string()))?;

    Ok((start, end))
}

fn extract_tag_name(tag_start: &str) -> String {
    tag_start
        .trim_start_matches('<')
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches('>')
        .to_string()
}

/// Drop every `ds:Signature`/`Signature` element from the content.
fn remove_signature_elements(xml: &str) -> String {
    let mut result = xml.to_string();
    for (open, close) in [
        ("<ds:Signature", "</ds:Signature>"),
        ("<Signature", "</Signature>"),
    ] {
        while let (Some(start), Some(end)) = (result.find(open), result.find(close)) {
            if end < start {
                break;
            }
            let mut stripped = String::with_capacity(result.len());
            stripped.push_str(&result[..start]);
            stripped.push_str(&result[end + close.len()..]);
            result = stripped;
        }
    }
    result
}

/// Pull every signature element out of the document.
fn extract_signatures(xml: &str) -> SamlResult<Vec<SignatureInfo>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut signatures = Vec::new();

    let mut in_signed_info = false;
    let mut in_signature_value = false;
    let mut in_digest_value = false;
    let mut signed_info = String::new();
    let mut signature_value = String::new();
    let mut digest_value = String::new();
    let mut reference_uri = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local_name = e.local_name();
                let name = std::str::from_utf8(local_name.as_ref()).unwrap_or("");

                if name == "SignedInfo" {
                    in_signed_info = true;
                    signed_info.clear();
                    push_start_tag(&mut signed_info, &e);
                } else if in_signed_info {
                    push_start_tag(&mut signed_info, &e);
                } else if name == "SignatureValue" {
                    in_signature_value = true;
                    signature_value.clear();
                } else if name == "DigestValue" {
                    in_digest_value = true;
                    digest_value.clear();
                }

                if name == "Reference" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"URI" {
                            reference_uri =
                                attr.unescape_value().unwrap_or_default().to_string();
                        }
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if in_signed_info {
                    let full_tag = std::str::from_utf8(&e).unwrap_or("");
                    signed_info.push('<');
                    signed_info.push_str(full_tag);
                    signed_info.push_str("/>");
                }
                let local_name = e.local_name();
                if local_name.as_ref() == b"Reference" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"URI" {
                            reference_uri =
                                attr.unescape_value().unwrap_or_default().to_string();
                        }
                    }
                }
            }
            Ok(Event::End(e)) => {
                let local_name = e.local_name();
                let name = std::str::from_utf8(local_name.as_ref()).unwrap_or("");

                if name == "SignedInfo" && in_signed_info {
                    signed_info.push_str("</");
                    signed_info.push_str(name);
                    signed_info.push('>');
                    in_signed_info = false;
                } else if in_signed_info {
                    signed_info.push_str("</");
                    signed_info.push_str(name);
                    signed_info.push('>');
                } else if name == "SignatureValue" {
                    in_signature_value = false;
                } else if name == "DigestValue" {
                    in_digest_value = false;
                } else if name == "Signature" {
                    // One complete signature element collected.
                    if !signed_info.is_empty() && !signature_value.is_empty() {
                        signatures.push(SignatureInfo {
                            signed_info: signed_info.clone(),
                            signature_value: signature_value.clone(),
                            reference_uri: reference_uri.clone(),
                            digest_value: digest_value.clone(),
                        });
                    }
                    signed_info.clear();
                    signature_value.clear();
                    digest_value.clear();
                    reference_uri.clear();
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default();
                if in_signed_info {
                    signed_info.push_str(&text);
                } else if in_signature_value {
                    signature_value.push_str(&text);
                } else if in_digest_value {
                    digest_value.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SamlError::SignatureInvalid(format!("XML parse error: {e}")));
            }
            _ => {}
        }
    }

    Ok(signatures)
}

fn push_start_tag(buf: &mut String, e: &quick_xml::events::BytesStart<'_>) {
    let full_tag = std::str::from_utf8(e).unwrap_or("");
    buf.push('<');
    buf.push_str(full_tag);
    buf.push('>');
}

/// Sign the element carrying `element_id` with an enveloped signature,
/// inserting `ds:Signature` after the element's `Issuer` when present.
/// Used for POST-binding request signing.
pub fn sign_enveloped(
    xml: &str,
    element_id: &str,
    credentials: &SigningCredentials,
) -> SamlResult<String> {
    let (start, end) = element_bounds(xml, element_id)
        .map_err(|e| SamlError::RequestBuildFailed(e.to_string()))?;
    let element = &xml[start..end];

    let canonical = canonicalize(element)?;
    let digest = openssl::hash::hash(MessageDigest::sha256(), canonical.as_bytes())
        .map_err(|e| SamlError::RequestBuildFailed(format!("digest: {e}")))?;
    let digest_b64 = STANDARD.encode(digest);

    let mut signed_info = String::new();
    signed_info.push_str("<ds:SignedInfo xmlns:ds=\"http://www.w3.org/2000/09/xmldsig#\">");
    signed_info.push_str(
        "<ds:CanonicalizationMethod Algorithm=\"http://www.w3.org/2001/10/xml-exc-c14n#\"/>",
    );
    signed_info.push_str(
        "<ds:SignatureMethod Algorithm=\"http://www.w3.org/2001/04/xmldsig-more#rsa-sha256\"/>",
    );
    signed_info.push_str("<ds:Reference URI=\"#");
    signed_info.push_str(element_id);
    signed_info.push_str("\">");
    signed_info.push_str("<ds:Transforms>");
    signed_info.push_str(
        "<ds:Transform Algorithm=\"http://www.w3.org/2000/09/xmldsig#enveloped-signature\"/>",
    );
    signed_info
        .push_str("<ds:Transform Algorithm=\"http://www.w3.org/2001/10/xml-exc-c14n#\"/>");
    signed_info.push_str("</ds:Transforms>");
    signed_info
        .push_str("<ds:DigestMethod Algorithm=\"http://www.w3.org/2001/04/xmlenc#sha256\"/>");
    signed_info.push_str("<ds:DigestValue>");
    signed_info.push_str(&digest_b64);
    signed_info.push_str("</ds:DigestValue>");
    signed_info.push_str("</ds:Reference>");
    signed_info.push_str("</ds:SignedInfo>");

    let canonical_signed_info = canonicalize(&signed_info)?;
    let signature = credentials.sign_sha256(canonical_signed_info.as_bytes())?;
    let signature_b64 = STANDARD.encode(&signature);
    let certificate_b64 = credentials.certificate_base64_der()?;

    let mut signature_xml =
        String::from("<ds:Signature xmlns:ds=\"http://www.w3.org/2000/09/xmldsig#\">");
    signature_xml.push_str(&signed_info);
    signature_xml.push_str("<ds:SignatureValue>");
    signature_xml.push_str(&signature_b64);
    signature_xml.push_str("</ds:SignatureValue><ds:KeyInfo><ds:X509Data><ds:X509Certificate>");
    signature_xml.push_str(&certificate_b64);
    signature_xml.push_str("</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature>");

    // Insert after the element-level Issuer when present, else right after
    // the opening tag.
    let insert_at = xml[start..end]
        .find("</saml:Issuer>")
        .map(|pos| start + pos + "</saml:Issuer>".len())
        .or_else(|| {
            xml[start..end]
                .find("</Issuer>")
                .map(|pos| start + pos + "</Issuer>".len())
        })
        .or_else(|| xml[start..].find('>').map(|pos| start + pos + 1))
        .ok_or_else(|| SamlError::RequestBuildFailed("no insertion point".to_string()))?;

    let mut result = String::with_capacity(xml.len() + signature_xml.len());
    result.push_str(&xml[..insert_at]);
    result.push_str(&signature_xml);
    result.push_str(&xml[insert_at..]);
    Ok(result)
}

/// Sign the redirect-binding query per the SAML bindings spec: the
/// signature covers `SAMLRequest=..&RelayState=..&SigAlg=..` with
/// URL-encoded values, in exactly that order.
pub fn sign_redirect_query(
    credentials: &SigningCredentials,
    saml_request_encoded: &str,
    relay_state_encoded: Option<&str>,
    sig_alg_encoded: &str,
) -> SamlResult<String> {
    let mut signed_data = format!("SAMLRequest={saml_request_encoded}");
    if let Some(relay_state) = relay_state_encoded {
        if !relay_state.is_empty() {
            signed_data.push_str("&RelayState=");
            signed_data.push_str(relay_state);
        }
    }
    signed_data.push_str("&SigAlg=");
    signed_data.push_str(sig_alg_encoded);

    let signature = credentials.sign_sha256(signed_data.as_bytes())?;
    Ok(STANDARD.encode(signature))
}


#[cfg(test)]
mod tests {
    use super::test_identity::generate;
    use super::*;

    fn sample_response(assertion_id: &str, response_id: &str) -> String {
        // The Assertion declares its namespace locally so it stays
        // well-formed when extracted and canonicalized on its own.
        format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{response_id}" Version="2.0"><saml:Issuer>https://idp.example.com</saml:Issuer><saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{assertion_id}" Version="2.0"><saml:Issuer>https://idp.example.com</saml:Issuer><saml:Subject><saml:NameID>jane@example.com</saml:NameID></saml:Subject></saml:Assertion></samlp:Response>"#
        )
    }

    #[test]
    fn test_sign_and_verify_assertion_signature() {
        let (key, cert) = generate();
        let credentials = SigningCredentials::from_pem(&key, cert.as_bytes()).unwrap();

        let xml = sample_response("_assert1", "_resp1");
        let signed = sign_enveloped(&xml, "_assert1", &credentials).unwrap();

        let location = verify_response_signature(&signed, &cert).unwrap();
        assert_eq!(location, SignatureLocation::Assertion);
    }

    #[test]
    fn test_sign_and_verify_response_signature() {
        let (key, cert) = generate();
        let credentials = SigningCredentials::from_pem(&key, cert.as_bytes()).unwrap();

        let xml = sample_response("_assert1", "_resp1");
        let signed = sign_enveloped(&xml, "_resp1", &credentials).unwrap();

        let location = verify_response_signature(&signed, &cert).unwrap();
        assert_eq!(location, SignatureLocation::Response);
    }

    #[test]
    fn test_tampered_content_fails_digest() {
        let (key, cert) = generate();
        let credentials = SigningCredentials::from_pem(&key, cert.as_bytes()).unwrap();

        let xml = sample_response("_assert1", "_resp1");
        let signed = sign_enveloped(&xml, "_assert1", &credentials).unwrap();
        let tampered = signed.replace("jane@example.com", "mallory@example.com");

        let err = verify_response_signature(&tampered, &cert).unwrap_err();
        assert!(matches!(err, SamlError::SignatureInvalid(_)));
    }

    #[test]
    fn test_wrong_certificate_fails() {
        let (key, cert) = generate();
        let (_other_key, other_cert) = generate();
        let credentials = SigningCredentials::from_pem(&key, cert.as_bytes()).unwrap();

        let xml = sample_response("_assert1", "_resp1");
        let signed = sign_enveloped(&xml, "_assert1", &credentials).unwrap();

        let err = verify_response_signature(&signed, &other_cert).unwrap_err();
        assert!(matches!(err, SamlError::SignatureInvalid(_)));
    }

    #[test]
    fn test_unsigned_document_rejected() {
        let (_key, cert) = generate();
        let xml = sample_response("_assert1", "_resp1");

        let err = verify_response_signature(&xml, &cert).unwrap_err();
        assert!(matches!(err, SamlError::SignatureInvalid(_)));
    }

    #[test]
    fn test_certificate_without_pem_headers() {
        let (_key, cert_pem) = generate();
        let body: String = cert_pem
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect();
        assert!(parse_certificate(&body).is_ok());
        assert!(parse_certificate(&cert_pem).is_ok());
        assert!(parse_certificate("not a certificate").is_err());
    }

    #[test]
    fn test_redirect_query_signing_is_verifiable() {
        let (key, cert) = generate();
        let credentials = SigningCredentials::from_pem(&key, cert.as_bytes()).unwrap();

        let saml_request = urlencoding::encode("deflated-base64-request").to_string();
        let relay_state = urlencoding::encode("signed.state.token").to_string();
        let sig_alg = urlencoding::encode(RSA_SHA256_URI).to_string();

        let signature_b64 =
            sign_redirect_query(&credentials, &saml_request, Some(&relay_state), &sig_alg)
                .unwrap();

        // Verify out-of-band with openssl over the exact signed string.
        let signed_data =
            format!("SAMLRequest={saml_request}&RelayState={relay_state}&SigAlg={sig_alg}");
        let cert = parse_certificate(&cert).unwrap();
        let public_key = cert.public_key().unwrap();
        let mut verifier = Verifier::new(MessageDigest::sha256(), &public_key).unwrap();
        verifier.update(signed_data.as_bytes()).unwrap();
        assert!(verifier
            .verify(&STANDARD.decode(signature_b64).unwrap())
            .unwrap());
    }

    #[test]
    fn test_remove_signature_elements() {
        let xml = r#"<A ID="x"><ds:Signature>sig</ds:Signature><B>keep</B></A>"#;
        let stripped = remove_signature_elements(xml);
        assert!(!stripped.contains("Signature"));
        assert!(stripped.contains("<B>keep</B>"));
    }
}
