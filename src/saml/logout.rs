//! Single Logout messages: LogoutRequest and LogoutResponse in both
//! directions, over the HTTP-Redirect and HTTP-POST bindings.

use chrono::{DateTime, Duration, Utc};
use openssl::x509::X509;
use tracing::warn;

use super::binding::{decode_and_inflate, decode_post, MessageParam, RedirectQuery};
use super::config::SamlConfig;
use super::dsig;
use super::error::{malformed, ValidationError};
use super::protocol::{
    check_destination, check_issuer, check_status, esc, format_instant, instant_attr, issuer,
    require_unique_ids, require_version, ASSERTION_NS, PROTOCOL_NS,
};
use super::xml::{self, Element};

/// An inbound logout message as the browser delivered it.
#[derive(Debug, Clone, Copy)]
pub enum InboundMessage<'a> {
    /// HTTP-Redirect binding: the full query, signature parameters included.
    Redirect(&'a RedirectQuery),
    /// HTTP-POST binding: the base64 form field.
    Post(&'a str),
}

/// A LogoutResponse that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutResponseInfo {
    pub id: String,
    pub in_response_to: Option<String>,
    pub signed: bool,
}

/// An IdP-initiated LogoutRequest that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutRequestInfo {
    pub id: String,
    pub name_id: String,
    pub session_indexes: Vec<String>,
    pub signed: bool,
}

pub fn render_logout_request(
    config: &SamlConfig,
    destination: &str,
    id: &str,
    issue_instant: DateTime<Utc>,
    name_id: &str,
    name_id_format: Option<&str>,
    session_index: Option<&str>,
) -> String {
    let format_attr = name_id_format
        .map(|f| format!(r#" Format="{}""#, esc(f)))
        .unwrap_or_default();
    let session_index = session_index
        .map(|s| format!("<samlp:SessionIndex>{}</samlp:SessionIndex>", esc(s)))
        .unwrap_or_default();

    format!(
        concat!(
            r#"<samlp:LogoutRequest xmlns:samlp="{protocol}" xmlns:saml="{assertion}""#,
            r#" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}">"#,
            r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
            r#"<saml:NameID{format}>{name_id}</saml:NameID>"#,
            r#"{session_index}"#,
            r#"</samlp:LogoutRequest>"#
        ),
        protocol = PROTOCOL_NS,
        assertion = ASSERTION_NS,
        id = id,
        instant = format_instant(issue_instant),
        destination = esc(destination),
        issuer = esc(&config.sp.entity_id),
        format = format_attr,
        name_id = esc(name_id),
        session_index = session_index,
    )
}

pub fn render_logout_response(
    config: &SamlConfig,
    destination: &str,
    id: &str,
    issue_instant: DateTime<Utc>,
    in_response_to: &str,
    status: &str,
) -> String {
    format!(
        concat!(
            r#"<samlp:LogoutResponse xmlns:samlp="{protocol}" xmlns:saml="{assertion}""#,
            r#" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}""#,
            r#" InResponseTo="{in_response_to}">"#,
            r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
            r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>"#,
            r#"</samlp:LogoutResponse>"#
        ),
        protocol = PROTOCOL_NS,
        assertion = ASSERTION_NS,
        id = id,
        instant = format_instant(issue_instant),
        destination = esc(destination),
        in_response_to = esc(in_response_to),
        issuer = esc(&config.sp.entity_id),
        status = status,
    )
}

/// Decode, parse and signature-check an inbound message. Returns the parsed
/// root and whether a signature covered it.
fn open_message(
    message: InboundMessage<'_>,
    param: MessageParam,
    idp_cert: &X509,
) -> Result<(Element, bool), ValidationError> {
    match message {
        InboundMessage::Redirect(query) => {
            let encoded = query
                .get(param.name())
                .ok_or_else(|| malformed(format!("missing {}", param.name())))?;
            let xml = decode_and_inflate(encoded)?;
            let doc = xml::parse(&xml).map_err(malformed)?;
            require_unique_ids(&doc)?;
            // Redirect-binding messages are signed at the query level only.
            if dsig::is_signed(&doc) {
                return Err(malformed("embedded signature in redirect binding"));
            }
            let signed = query.verify_signature(param, idp_cert)?;
            Ok((doc, signed))
        }
        InboundMessage::Post(encoded) => {
            let xml = decode_post(encoded)?;
            let doc = xml::parse(&xml).map_err(malformed)?;
            require_unique_ids(&doc)?;
            let signed = dsig::is_signed(&doc);
            if signed {
                dsig::verify_enveloped(&xml, &doc, idp_cert)?;
            }
            Ok((doc, signed))
        }
    }
}

fn require_signed(signed: bool, strict: bool, what: &str) -> Result<(), ValidationError> {
    if signed {
        return Ok(());
    }
    if strict {
        return Err(ValidationError::InvalidSignature(format!("{} is not signed", what)));
    }
    warn!(kind = what, "Accepting unsigned logout message (strict mode is off)");
    Ok(())
}

fn message_id(doc: &Element) -> Result<String, ValidationError> {
    doc.attr("ID")
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| malformed(format!("<{}> has no ID", doc.name)))
}

/// The Issuer is mandatory on logout messages.
fn require_issuer(doc: &Element, expected: &str) -> Result<(), ValidationError> {
    if issuer(doc).is_none() {
        return Err(malformed(format!("<{}> has no Issuer", doc.name)));
    }
    check_issuer(doc, expected)
}

/// Validate the IdP's answer to our LogoutRequest.
pub fn parse_logout_response(
    message: InboundMessage<'_>,
    config: &SamlConfig,
    idp_cert: &X509,
) -> Result<LogoutResponseInfo, ValidationError> {
    let (doc, signed) = open_message(message, MessageParam::Response, idp_cert)?;
    if !doc.is(PROTOCOL_NS, "LogoutResponse") {
        return Err(malformed(format!(
            "expected samlp:LogoutResponse, got <{}>",
            doc.name
        )));
    }
    require_version(&doc)?;
    require_signed(signed, config.policy.strict, "LogoutResponse")?;
    require_issuer(&doc, &config.idp.entity_id)?;
    check_destination(&doc, &config.sp.slo_url)?;
    check_status(&doc)?;

    Ok(LogoutResponseInfo {
        id: message_id(&doc)?,
        in_response_to: doc.attr("InResponseTo").map(str::to_string),
        signed,
    })
}

/// Validate an IdP-initiated LogoutRequest.
pub fn parse_logout_request(
    message: InboundMessage<'_>,
    config: &SamlConfig,
    idp_cert: &X509,
    now: DateTime<Utc>,
) -> Result<LogoutRequestInfo, ValidationError> {
    let (doc, signed) = open_message(message, MessageParam::Request, idp_cert)?;
    if !doc.is(PROTOCOL_NS, "LogoutRequest") {
        return Err(malformed(format!(
            "expected samlp:LogoutRequest, got <{}>",
            doc.name
        )));
    }
    require_version(&doc)?;
    require_signed(signed, config.policy.strict, "LogoutRequest")?;
    require_issuer(&doc, &config.idp.entity_id)?;
    check_destination(&doc, &config.sp.slo_url)?;

    if let Some(until) = instant_attr(&doc, "NotOnOrAfter")? {
        if now - Duration::seconds(config.policy.clock_skew_secs) >= until {
            return Err(ValidationError::ExpiredAssertion(format!(
                "LogoutRequest NotOnOrAfter {} has passed",
                format_instant(until)
            )));
        }
    }

    if doc.child(ASSERTION_NS, "EncryptedID").is_some() {
        return Err(malformed("encrypted NameID is not supported"));
    }
    let name_id = doc
        .child(ASSERTION_NS, "NameID")
        .map(|n| n.text())
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| malformed("LogoutRequest has no NameID"))?;

    let session_indexes = doc
        .children_named(PROTOCOL_NS, "SessionIndex")
        .filter_map(|s| s.trimmed_text())
        .collect();

    Ok(LogoutRequestInfo {
        id: message_id(&doc)?,
        name_id,
        session_indexes,
        signed,
    })
}
