//! Inbound `SAMLResponse` parsing and validation.
//!
//! Parsing is a streaming pass that pulls out exactly the pieces the
//! validator needs. Validation checks every gate and reports the full list
//! of failures, so the audit trail shows everything that was wrong with a
//! rejected response, while callers still only see a generic failure.

use crate::error::{SamlError, SamlResult};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;

/// Clock-skew tolerance for `NotBefore`/`NotOnOrAfter` checks.
pub const CLOCK_SKEW_SECS: i64 = 120;

/// Maximum accepted base64 payload (512 KB), matching the POST binding cap.
const MAX_ENCODED_SIZE: usize = 512 * 1024;

/// A raw attribute pulled from the assertion.
#[derive(Debug, Clone)]
pub struct RawAttribute {
    pub name: String,
    pub friendly_name: Option<String>,
    pub values: Vec<String>,
}

/// `SubjectConfirmationData` fields the validator checks.
#[derive(Debug, Clone, Default)]
pub struct SubjectConfirmationData {
    pub recipient: Option<String>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub in_response_to: Option<String>,
}

/// The single assertion of a response.
#[derive(Debug, Clone, Default)]
pub struct ParsedAssertion {
    pub name_id: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub audiences: Vec<String>,
    pub subject_confirmation: Option<SubjectConfirmationData>,
    pub attributes: Vec<RawAttribute>,
}

/// A parsed `Response` document.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub id: Option<String>,
    pub destination: Option<String>,
    pub in_response_to: Option<String>,
    pub issuer: Option<String>,
    pub assertion: ParsedAssertion,
}

/// Decode the base64 POST payload into XML, with a size cap applied before
/// the decode.
pub fn decode_response(encoded: &str) -> SamlResult<String> {
    let trimmed = encoded.trim();
    if trimmed.is_empty() {
        return Err(SamlError::MissingResponse);
    }
    if trimmed.len() > MAX_ENCODED_SIZE {
        return Err(SamlError::ResponseTooLarge);
    }

    let decoded = STANDARD
        .decode(trimmed)
        .map_err(|e| SamlError::MalformedResponse(format!("base64 decode failed: {e}")))?;

    String::from_utf8(decoded)
        .map_err(|e| SamlError::MalformedResponse(format!("invalid UTF-8: {e}")))
}

/// Parse the response XML. The document must carry exactly one assertion.
pub fn parse_response(xml: &str) -> SamlResult<ParsedResponse> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut response_id = None;
    let mut destination = None;
    let mut in_response_to = None;
    let mut issuer: Option<String> = None;

    let mut assertion_count = 0usize;
    let mut assertion = ParsedAssertion::default();

    let mut in_assertion = false;
    let mut in_issuer = false;
    let mut in_name_id = false;
    let mut in_audience = false;
    let mut in_attribute_value = false;
    let mut current_attribute: Option<RawAttribute> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e) | Event::Empty(e)) => {
                let local_name = e.local_name();
                let name = std::str::from_utf8(local_name.as_ref()).unwrap_or("");

                match name {
                    "Response" => {
                        for attr in e.attributes().flatten() {
                            let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
                            let value = attr.unescape_value().unwrap_or_default().to_string();
                            match key {
                                "ID" => response_id = Some(value),
                                "Destination" => destination = Some(value),
                                "InResponseTo" => in_response_to = Some(value),
                                _ => {}
                            }
                        }
                    }
                    "Assertion" => {
                        assertion_count += 1;
                        in_assertion = true;
                    }
                    "Issuer" => in_issuer = true,
                    "NameID" if in_assertion => in_name_id = true,
                    "Conditions" if in_assertion => {
                        for attr in e.attributes().flatten() {
                            let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
                            let value = attr.unescape_value().unwrap_or_default();
                            match key {
                                "NotBefore" => assertion.not_before = parse_instant(&value),
                                "NotOnOrAfter" => {
                                    assertion.not_on_or_after = parse_instant(&value);
                                }
                                _ => {}
                            }
                        }
                    }
                    "Audience" if in_assertion => in_audience = true,
                    "SubjectConfirmationData" if in_assertion => {
                        let mut data = SubjectConfirmationData::default();
                        for attr in e.attributes().flatten() {
                            let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
                            let value = attr.unescape_value().unwrap_or_default().to_string();
                            match key {
                                "Recipient" => data.recipient = Some(value),
                                "NotOnOrAfter" => {
                                    data.not_on_or_after = parse_instant(&value);
                                }
                                "InResponseTo" => data.in_response_to = Some(value),
                                _ => {}
                            }
                        }
                        assertion.subject_confirmation = Some(data);
                    }
                    "Attribute" if in_assertion => {
                        let mut attribute = RawAttribute {
                            name: String::new(),
                            friendly_name: None,
                            values: Vec::new(),
                        };
                        for attr in e.attributes().flatten() {
                            let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
                            let value = attr.unescape_value().unwrap_or_default().to_string();
                            match key {
                                "Name" => attribute.name = value,
                                "FriendlyName" => attribute.friendly_name = Some(value),
                                _ => {}
                            }
                        }
                        current_attribute = Some(attribute);
                    }
                    "AttributeValue" if in_assertion => in_attribute_value = true,
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if in_issuer {
                    // Response-level issuer wins; the assertion repeats it.
                    if issuer.is_none() {
                        issuer = Some(text);
                    }
                } else if in_name_id {
                    assertion.name_id = Some(text);
                } else if in_audience {
                    assertion.audiences.push(text);
                } else if in_attribute_value {
                    if let Some(attribute) = current_attribute.as_mut() {
                        attribute.values.push(text);
                    }
                }
            }
            Ok(Event::End(e)) => {
                let local_name = e.local_name();
                let name = std::str::from_utf8(local_name.as_ref()).unwrap_or("");
                match name {
                    "Assertion" => in_assertion = false,
                    "Issuer" => in_issuer = false,
                    "NameID" => in_name_id = false,
                    "Audience" => in_audience = false,
                    "AttributeValue" => in_attribute_value = false,
                    "Attribute" => {
                        if let Some(attribute) = current_attribute.take() {
                            if !attribute.name.is_empty() {
                                assertion.attributes.push(attribute);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SamlError::MalformedResponse(format!("XML parse error: {e}")));
            }
            _ => {}
        }
    }

    match assertion_count {
        0 => Err(SamlError::MalformedResponse(
            "response carries no assertion".to_string(),
        )),
        1 => Ok(ParsedResponse {
            id: response_id,
            destination,
            in_response_to,
            issuer,
            assertion,
        }),
        n => Err(SamlError::MalformedResponse(format!(
            "response carries {n} assertions, expected one"
        ))),
    }
}

fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// What the response must match.
#[derive(Debug, Clone)]
pub struct ValidationParams<'a> {
    pub acs_url: &'a str,
    pub sp_entity_id: &'a str,
    /// Expected `InResponseTo`, when the flow was SP-initiated.
    pub expected_request_id: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// Run every validation gate, returning the full failure list.
pub fn validate_response(
    parsed: &ParsedResponse,
    params: &ValidationParams<'_>,
) -> Result<(), Vec<String>> {
    let mut failures = Vec::new();
    let now = params.now;

    if let Some(destination) = &parsed.destination {
        if !url_eq(destination, params.acs_url) {
            failures.push(format!(
                "Destination does not match the ACS URL: {destination}"
            ));
        }
    }

    if let (Some(expected), Some(declared)) =
        (params.expected_request_id, parsed.in_response_to.as_deref())
    {
        if expected != declared {
            failures.push("InResponseTo does not match the issued request id".to_string());
        }
    }

    let assertion = &parsed.assertion;

    if let Some(not_before) = assertion.not_before {
        if now.timestamp() + CLOCK_SKEW_SECS < not_before.timestamp() {
            failures.push("assertion is not yet valid (NotBefore)".to_string());
        }
    }
    if let Some(not_on_or_after) = assertion.not_on_or_after {
        if now.timestamp() - CLOCK_SKEW_SECS >= not_on_or_after.timestamp() {
            failures.push("assertion has expired (NotOnOrAfter)".to_string());
        }
    }

    if assertion.audiences.is_empty() {
        failures.push("assertion carries no AudienceRestriction".to_string());
    } else if !assertion
        .audiences
        .iter()
        .any(|audience| url_eq(audience, params.sp_entity_id))
    {
        failures.push("AudienceRestriction does not include this service provider".to_string());
    }

    if let Some(confirmation) = &assertion.subject_confirmation {
        if let Some(recipient) = &confirmation.recipient {
            if !url_eq(recipient, params.acs_url) {
                failures.push("SubjectConfirmationData Recipient mismatch".to_string());
            }
        }
        if let Some(not_on_or_after) = confirmation.not_on_or_after {
            if now.timestamp() - CLOCK_SKEW_SECS >= not_on_or_after.timestamp() {
                failures.push("SubjectConfirmationData has expired".to_string());
            }
        }
        if let (Some(expected), Some(declared)) = (
            params.expected_request_id,
            confirmation.in_response_to.as_deref(),
        ) {
            if expected != declared {
                failures.push(
                    "SubjectConfirmationData InResponseTo does not match the issued request id"
                        .to_string(),
                );
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures)
    }
}

/// Trailing-slash-insensitive URL comparison.
fn url_eq(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn sample_response_xml(
        not_before: DateTime<Utc>,
        not_on_or_after: DateTime<Utc>,
        audience: &str,
        in_response_to: Option<&str>,
    ) -> String {
        let irt = in_response_to
            .map(|id| format!(" InResponseTo=\"{id}\""))
            .unwrap_or_default();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
    ID="_resp1" Version="2.0" Destination="https://sp.example.com/saml/acs"{irt}>
    <saml:Issuer>https://idp.example.com</saml:Issuer>
    <saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_assert1" Version="2.0">
        <saml:Issuer>https://idp.example.com</saml:Issuer>
        <saml:Subject>
            <saml:NameID>jane@example.com</saml:NameID>
            <saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">
                <saml:SubjectConfirmationData Recipient="https://sp.example.com/saml/acs"
                    NotOnOrAfter="{noa}"{irt}/>
            </saml:SubjectConfirmation>
        </saml:Subject>
        <saml:Conditions NotBefore="{nb}" NotOnOrAfter="{noa}">
            <saml:AudienceRestriction>
                <saml:Audience>{audience}</saml:Audience>
            </saml:AudienceRestriction>
        </saml:Conditions>
        <saml:AttributeStatement>
            <saml:Attribute Name="http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress" FriendlyName="email">
                <saml:AttributeValue>jane@example.com</saml:AttributeValue>
            </saml:Attribute>
            <saml:Attribute Name="groups">
                <saml:AttributeValue>Auditors</saml:AttributeValue>
                <saml:AttributeValue>auditors</saml:AttributeValue>
                <saml:AttributeValue>Compliance</saml:AttributeValue>
            </saml:Attribute>
        </saml:AttributeStatement>
    </saml:Assertion>
</samlp:Response>"#,
            nb = not_before.to_rfc3339(),
            noa = not_on_or_after.to_rfc3339(),
        )
    }

    fn params(now: DateTime<Utc>) -> ValidationParams<'static> {
        ValidationParams {
            acs_url: "https://sp.example.com/saml/acs",
            sp_entity_id: "https://sp.example.com/saml/metadata",
            expected_request_id: None,
            now,
        }
    }

    #[test]
    fn test_parse_extracts_structure() {
        let now = Utc::now();
        let xml = sample_response_xml(
            now - Duration::minutes(2),
            now + Duration::minutes(5),
            "https://sp.example.com/saml/metadata",
            Some("_req1"),
        );

        let parsed = parse_response(&xml).unwrap();
        assert_eq!(parsed.id.as_deref(), Some("_resp1"));
        assert_eq!(
            parsed.destination.as_deref(),
            Some("https://sp.example.com/saml/acs")
        );
        assert_eq!(parsed.in_response_to.as_deref(), Some("_req1"));
        assert_eq!(parsed.issuer.as_deref(), Some("https://idp.example.com"));
        assert_eq!(parsed.assertion.name_id.as_deref(), Some("jane@example.com"));
        assert_eq!(parsed.assertion.attributes.len(), 2);
        assert_eq!(parsed.assertion.attributes[1].values.len(), 3);
        assert!(parsed.assertion.subject_confirmation.is_some());
    }

    #[test]
    fn test_zero_assertions_rejected() {
        let xml = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_r"/>"#;
        let err = parse_response(xml).unwrap_err();
        assert!(matches!(err, SamlError::MalformedResponse(_)));
    }

    #[test]
    fn test_multiple_assertions_rejected() {
        let xml = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
            xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_r">
            <saml:Assertion ID="_a1"><saml:Issuer>x</saml:Issuer></saml:Assertion>
            <saml:Assertion ID="_a2"><saml:Issuer>x</saml:Issuer></saml:Assertion>
        </samlp:Response>"#;
        let err = parse_response(xml).unwrap_err();
        assert!(matches!(err, SamlError::MalformedResponse(_)));
    }

    #[test]
    fn test_valid_window_passes() {
        let now = Utc::now();
        let xml = sample_response_xml(
            now - Duration::minutes(2),
            now + Duration::minutes(5),
            "https://sp.example.com/saml/metadata",
            None,
        );
        let parsed = parse_response(&xml).unwrap();
        assert!(validate_response(&parsed, &params(now)).is_ok());
    }

    #[test]
    fn test_expiry_beyond_skew_rejected() {
        let now = Utc::now();
        // NotOnOrAfter 200 seconds in the past: outside the 120 s skew.
        let xml = sample_response_xml(
            now - Duration::minutes(30),
            now - Duration::seconds(200),
            "https://sp.example.com/saml/metadata",
            None,
        );
        let parsed = parse_response(&xml).unwrap();
        let failures = validate_response(&parsed, &params(now)).unwrap_err();
        assert!(failures.iter().any(|f| f.contains("expired")));
    }

    #[test]
    fn test_expiry_within_skew_accepted() {
        let now = Utc::now();
        // NotOnOrAfter 60 seconds in the past: inside the 120 s skew.
        let xml = sample_response_xml(
            now - Duration::minutes(30),
            now - Duration::seconds(60),
            "https://sp.example.com/saml/metadata",
            None,
        );
        let parsed = parse_response(&xml).unwrap();
        assert!(validate_response(&parsed, &params(now)).is_ok());
    }

    #[test]
    fn test_not_before_in_future_rejected() {
        let now = Utc::now();
        let xml = sample_response_xml(
            now + Duration::seconds(600),
            now + Duration::seconds(900),
            "https://sp.example.com/saml/metadata",
            None,
        );
        let parsed = parse_response(&xml).unwrap();
        let failures = validate_response(&parsed, &params(now)).unwrap_err();
        assert!(failures.iter().any(|f| f.contains("NotBefore")));
    }

    #[test]
    fn test_wrong_audience_rejected() {
        let now = Utc::now();
        let xml = sample_response_xml(
            now - Duration::minutes(2),
            now + Duration::minutes(5),
            "https://other-sp.example.com",
            None,
        );
        let parsed = parse_response(&xml).unwrap();
        let failures = validate_response(&parsed, &params(now)).unwrap_err();
        assert!(failures.iter().any(|f| f.contains("AudienceRestriction")));
    }

    #[test]
    fn test_audience_trailing_slash_insensitive() {
        let now = Utc::now();
        let xml = sample_response_xml(
            now - Duration::minutes(2),
            now + Duration::minutes(5),
            "https://sp.example.com/saml/metadata/",
            None,
        );
        let parsed = parse_response(&xml).unwrap();
        assert!(validate_response(&parsed, &params(now)).is_ok());
    }

    #[test]
    fn test_in_response_to_mismatch_rejected() {
        let now = Utc::now();
        let xml = sample_response_xml(
            now - Duration::minutes(2),
            now + Duration::minutes(5),
            "https://sp.example.com/saml/metadata",
            Some("_other_request"),
        );
        let parsed = parse_response(&xml).unwrap();

        let mut p = params(now);
        p.expected_request_id = Some("_req1");
        let failures = validate_response(&parsed, &p).unwrap_err();
        assert!(failures.iter().any(|f| f.contains("InResponseTo")));
    }

    #[test]
    fn test_destination_mismatch_rejected() {
        let now = Utc::now();
        let xml = sample_response_xml(
            now - Duration::minutes(2),
            now + Duration::minutes(5),
            "https://sp.example.com/saml/metadata",
            None,
        );
        let parsed = parse_response(&xml).unwrap();

        let mut p = params(now);
        p.acs_url = "https://elsewhere.example.com/acs";
        let failures = validate_response(&parsed, &p).unwrap_err();
        // Destination and Recipient both point at the real ACS.
        assert!(failures.iter().any(|f| f.contains("Destination")));
    }

    #[test]
    fn test_decode_response_guards() {
        assert!(matches!(
            decode_response("  "),
            Err(SamlError::MissingResponse)
        ));
        assert!(matches!(
            decode_response("!!!not-base64!!!"),
            Err(SamlError::MalformedResponse(_))
        ));

        let oversized = "A".repeat(600 * 1024);
        assert!(matches!(
            decode_response(&oversized),
            Err(SamlError::ResponseTooLarge)
        ));

        let xml = "<x/>";
        let encoded = STANDARD.encode(xml);
        assert_eq!(decode_response(&encoded).unwrap(), xml);
    }
}
