//! Claim extraction from a parsed assertion.

use crate::response::ParsedAssertion;
use std::collections::HashMap;

/// Claim keys tried, in order, when resolving the subject's email.
pub const EMAIL_CLAIM_CANDIDATES: [&str; 6] = [
    "email",
    "mail",
    "emailaddress",
    "user.email",
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress",
    "subject.name_id",
];

/// Build the claim map for an assertion.
///
/// Every attribute is stored under its raw `Name` (case preserved) and
/// under a lowercased alias; `FriendlyName` gets the same treatment. The
/// NameID lands under `subject.name_id`. Values accumulate per key and are
/// deduplicated case-insensitively, keeping the first spelling seen.
#[must_use]
pub fn claim_map(assertion: &ParsedAssertion) -> HashMap<String, Vec<String>> {
    let mut claims: HashMap<String, Vec<String>> = HashMap::new();

    if let Some(name_id) = &assertion.name_id {
        claims.insert("subject.name_id".to_string(), vec![name_id.clone()]);
    }

    for attribute in &assertion.attributes {
        let mut keys = vec![attribute.name.clone()];
        let lower = attribute.name.to_lowercase();
        if lower != attribute.name {
            keys.push(lower);
        }
        if let Some(friendly) = &attribute.friendly_name {
            keys.push(friendly.clone());
            let friendly_lower = friendly.to_lowercase();
            if friendly_lower != *friendly {
                keys.push(friendly_lower);
            }
        }

        for key in keys {
            let entry = claims.entry(key).or_default();
            for value in &attribute.values {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let duplicate = entry
                    .iter()
                    .any(|existing| existing.eq_ignore_ascii_case(trimmed));
                if !duplicate {
                    entry.push(trimmed.to_string());
                }
            }
        }
    }

    claims
}

/// Resolve the subject's email from the candidate claim keys; the first
/// value containing `@` wins.
#[must_use]
pub fn resolve_email(claims: &HashMap<String, Vec<String>>) -> Option<String> {
    for candidate in EMAIL_CLAIM_CANDIDATES {
        let values = claims
            .get(candidate)
            .or_else(|| claims.get(&candidate.to_lowercase()));
        if let Some(values) = values {
            if let Some(email) = values.iter().find(|v| v.contains('@')) {
                return Some(email.clone());
            }
        }
    }
    None
}

/// Resolve a display name: the configured attribute first, then common
/// fallbacks, then the email.
#[must_use]
pub fn resolve_display_name(
    claims: &HashMap<String, Vec<String>>,
    name_attribute: Option<&str>,
    email: &str,
) -> String {
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(configured) = name_attribute {
        candidates.push(configured);
    }
    candidates.extend(["displayname", "name", "cn"]);

    for candidate in candidates {
        if let Some(values) = claims
            .get(candidate)
            .or_else(|| claims.get(&candidate.to_lowercase()))
        {
            if let Some(name) = values.first() {
                return name.clone();
            }
        }
    }

    let given = claims.get("givenname").and_then(|v| v.first());
    let surname = claims.get("surname").or_else(|| claims.get("sn")).and_then(|v| v.first());
    match (given, surname) {
        (Some(g), Some(s)) => format!("{g} {s}"),
        (Some(g), None) => g.clone(),
        (None, Some(s)) => s.clone(),
        (None, None) => email.to_string(),
    }
}
