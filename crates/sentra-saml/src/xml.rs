//! Small XML helpers shared by the builders and validators.

use crate::error::{SamlError, SamlResult};
use xml_canonicalization::Canonicalizer;

/// Escape text for inclusion in XML content or attribute values.
pub(crate) fn xml_escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&apos;"),
            _ => result.push(c),
        }
    }
    result
}

/// Apply Exclusive XML Canonicalization (C14N) without comments.
pub(crate) fn canonicalize(xml: &str) -> SamlResult<String> {
    let mut output = Vec::new();
    Canonicalizer::read_from_str(xml)
        .write_to_writer(&mut output)
        .canonicalize(false)
        .map_err(|e| SamlError::SignatureInvalid(format!("canonicalization failed: {e}")))?;

    String::from_utf8(output)
        .map_err(|e| SamlError::SignatureInvalid(format!("canonicalized XML not UTF-8: {e}")))
}
