//! Round-trip check: an AuthnRequest we build must survive our own
//! redirect-binding codec and parse back with identical fields.

use sentra_saml::{
    deflate_base64, inflate_base64, parse_authn_request, redirect_query, AuthnRequestBuilder,
};

const SP_ENTITY_ID: &str = "https://grc.example.com/saml/metadata";
const ACS_URL: &str = "https://grc.example.com/saml/acs";
const IDP_SSO_URL: &str = "https://idp.example.com/sso";

#[test]
fn authn_request_round_trip() {
    let built = AuthnRequestBuilder::new(SP_ENTITY_ID, ACS_URL, IDP_SSO_URL)
        .passive(true)
        .build("_req_round_trip");

    let encoded = deflate_base64(&built.xml).unwrap();
    let decoded = inflate_base64(&encoded).unwrap();
    let parsed = parse_authn_request(&decoded).unwrap();

    assert_eq!(parsed.id, "_req_round_trip");
    assert_eq!(parsed.issuer, SP_ENTITY_ID);
    assert_eq!(parsed.destination.as_deref(), Some(IDP_SSO_URL));
    assert_eq!(parsed.assertion_consumer_service_url.as_deref(), Some(ACS_URL));
    assert!(parsed.is_passive);
}

#[test]
fn redirect_query_round_trip() {
    let built =
        AuthnRequestBuilder::new(SP_ENTITY_ID, ACS_URL, IDP_SSO_URL).build("_req_query");
    let deflated = deflate_base64(&built.xml).unwrap();

    let query = redirect_query(&deflated, Some("relay-token"), None).unwrap();
    let saml_request = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("SAMLRequest="))
        .expect("query carries SAMLRequest");

    let xml = inflate_base64(&urlencoding::decode(saml_request).unwrap()).unwrap();
    let parsed = parse_authn_request(&xml).unwrap();
    assert_eq!(parsed.id, "_req_query");
}
