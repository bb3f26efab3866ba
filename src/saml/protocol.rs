//! Namespaces, identifiers and checks shared by every SAML protocol message.

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::escape::escape;

use super::error::{malformed, ValidationError};
use super::xml::Element;

pub const PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const METADATA_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const STATUS_REQUESTER: &str = "urn:oasis:names:tc:SAML:2.0:status:Requester";

pub const BINDING_HTTP_POST: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";
pub const BINDING_HTTP_REDIRECT: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";

pub const CM_BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

/// Fresh message ID. IDs are xs:ID values, so they must not start with a digit.
pub fn new_message_id() -> String {
    format!("_{}", uuid::Uuid::new_v4().simple())
}

pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_instant(value: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| malformed(format!("invalid timestamp {:?}: {}", value, e)))
}

/// Optional timestamp attribute.
pub fn instant_attr(element: &Element, name: &str) -> Result<Option<DateTime<Utc>>, ValidationError> {
    element.attr(name).map(parse_instant).transpose()
}

/// Escape text for inclusion in generated XML (content or attribute value).
pub fn esc(value: &str) -> String {
    escape(value).into_owned()
}

/// Require `Version="2.0"` on a protocol message or assertion.
pub fn require_version(element: &Element) -> Result<(), ValidationError> {
    match element.attr("Version") {
        Some("2.0") => Ok(()),
        other => Err(malformed(format!(
            "unsupported SAML version {:?} on <{}>",
            other, element.name
        ))),
    }
}

/// Reject documents where an ID appears twice. Signature references resolve
/// by ID, so duplicates are the building block of signature wrapping.
pub fn require_unique_ids(root: &Element) -> Result<(), ValidationError> {
    let mut ids = Vec::new();
    root.collect_ids(&mut ids);
    ids.sort_unstable();
    match ids.windows(2).find(|w| w[0] == w[1]) {
        Some(dup) => Err(malformed(format!("duplicate ID {:?}", dup[0]))),
        None => Ok(()),
    }
}

/// Top-level status code, with any nested second-level code and message.
pub fn check_status(message: &Element) -> Result<(), ValidationError> {
    let status = message
        .child(PROTOCOL_NS, "Status")
        .ok_or_else(|| malformed("missing Status"))?;
    let code = status
        .child(PROTOCOL_NS, "StatusCode")
        .ok_or_else(|| malformed("missing StatusCode"))?;

    match code.attr("Value") {
        Some(STATUS_SUCCESS) => Ok(()),
        value => {
            let mut detail = value.unwrap_or("<none>").to_string();
            if let Some(sub) = code
                .child(PROTOCOL_NS, "StatusCode")
                .and_then(|c| c.attr("Value"))
            {
                detail.push_str(" / ");
                detail.push_str(sub);
            }
            if let Some(msg) = status
                .child(PROTOCOL_NS, "StatusMessage")
                .and_then(|m| m.trimmed_text())
            {
                detail.push_str(": ");
                detail.push_str(&msg);
            }
            Err(ValidationError::StatusFailure(detail))
        }
    }
}

/// Issuer of a message, when present.
pub fn issuer(element: &Element) -> Option<String> {
    element
        .child(ASSERTION_NS, "Issuer")
        .and_then(|i| i.trimmed_text())
}

/// An Issuer that is present must name the IdP.
pub fn check_issuer(element: &Element, expected: &str) -> Result<(), ValidationError> {
    match issuer(element) {
        Some(found) if found != expected => Err(ValidationError::IssuerMismatch(format!(
            "<{}> issued by {:?}, expected {:?}",
            element.name, found, expected
        ))),
        _ => Ok(()),
    }
}

/// A Destination that is present must name our endpoint.
pub fn check_destination(element: &Element, expected: &str) -> Result<(), ValidationError> {
    match element.attr("Destination") {
        Some(found) if found != expected => Err(ValidationError::DestinationMismatch(format!(
            "Destination {:?}, expected {:?}",
            found, expected
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::xml::parse;

    #[test]
    fn test_message_ids_are_ncnames() {
        let a = new_message_id();
        let b = new_message_id();
        assert!(a.starts_with('_'));
        assert_ne!(a, b);
    }

    #[test]
    fn test_instant_round_trip() {
        let now = Utc::now();
        let parsed = parse_instant(&format_instant(now)).unwrap();
        assert_eq!(parsed.timestamp(), now.timestamp());
        assert!(parse_instant("2024-13-01").is_err());
        assert_eq!(
            parse_instant("2024-01-01T00:00:00.123Z").unwrap().timestamp(),
            1_704_067_200
        );
    }

    #[test]
    fn test_status_failure_detail() {
        let doc = parse(&format!(
            r#"<samlp:Response xmlns:samlp="{}"><samlp:Status><samlp:StatusCode Value="{}"><samlp:StatusCode Value="urn:x:AuthnFailed"/></samlp:StatusCode><samlp:StatusMessage>nope</samlp:StatusMessage></samlp:Status></samlp:Response>"#,
            PROTOCOL_NS, STATUS_REQUESTER
        ))
        .unwrap();
        let err = check_status(&doc).unwrap_err();
        assert_eq!(
            err,
            ValidationError::StatusFailure(format!("{} / urn:x:AuthnFailed: nope", STATUS_REQUESTER))
        );
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let doc = parse(r#"<a ID="x"><b ID="y"/><c ID="x"/></a>"#).unwrap();
        assert!(require_unique_ids(&doc).is_err());
        let doc = parse(r#"<a ID="x"><b ID="y"/></a>"#).unwrap();
        assert!(require_unique_ids(&doc).is_ok());
    }

    #[test]
    fn test_escape() {
        assert_eq!(esc(r#"a&b<"c">"#), "a&amp;b&lt;&quot;c&quot;&gt;");
    }
}
