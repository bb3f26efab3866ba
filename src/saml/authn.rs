//! AuthnRequest construction and AuthnResponse validation (Web Browser SSO).

use chrono::{DateTime, Duration, Utc};
use openssl::x509::X509;
use std::collections::HashMap;

use super::claims::AssertionClaims;
use super::config::SamlConfig;
use super::dsig;
use super::error::{malformed, ValidationError};
use super::protocol::{
    check_destination, check_issuer, check_status, esc, format_instant, instant_attr, issuer,
    require_unique_ids, require_version, ASSERTION_NS, BINDING_HTTP_POST, CM_BEARER, PROTOCOL_NS,
};
use super::xml::{self, Element};

const PASSWORD_PROTECTED_TRANSPORT: &str =
    "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport";

/// Render an AuthnRequest.
pub fn render_authn_request(config: &SamlConfig, id: &str, issue_instant: DateTime<Utc>) -> String {
    let requested_context = if config.sp.requested_authn_context {
        format!(
            r#"<samlp:RequestedAuthnContext Comparison="exact"><saml:AuthnContextClassRef>{}</saml:AuthnContextClassRef></samlp:RequestedAuthnContext>"#,
            PASSWORD_PROTECTED_TRANSPORT
        )
    } else {
        String::new()
    };

    format!(
        concat!(
            r#"<samlp:AuthnRequest xmlns:samlp="{protocol}" xmlns:saml="{assertion}""#,
            r#" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}""#,
            r#" ProtocolBinding="{binding}" AssertionConsumerServiceURL="{acs}">"#,
            r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
            r#"<samlp:NameIDPolicy Format="{format}" AllowCreate="true"/>"#,
            r#"{context}"#,
            r#"</samlp:AuthnRequest>"#
        ),
        protocol = PROTOCOL_NS,
        assertion = ASSERTION_NS,
        id = id,
        instant = format_instant(issue_instant),
        destination = esc(&config.idp.sso_url),
        binding = BINDING_HTTP_POST,
        acs = esc(&config.sp.acs_url),
        issuer = esc(&config.sp.entity_id),
        format = esc(&config.sp.name_id_format),
        context = requested_context,
    )
}

/// Validate a decoded `samlp:Response` and extract the asserted identity.
///
/// Checks run in a fixed order: structure, status, signature, issuer, time
/// window, audience, destination, subject. Correlation and replay checks need
/// state and are left to the caller.
pub fn parse_authn_response(
    response_xml: &str,
    config: &SamlConfig,
    idp_cert: &X509,
    now: DateTime<Utc>,
) -> Result<AssertionClaims, ValidationError> {
    let doc = xml::parse(response_xml).map_err(malformed)?;
    if !doc.is(PROTOCOL_NS, "Response") {
        return Err(malformed(format!("expected samlp:Response, got <{}>", doc.name)));
    }
    require_version(&doc)?;
    require_unique_ids(&doc)?;

    check_status(&doc)?;

    if doc.child(ASSERTION_NS, "EncryptedAssertion").is_some() {
        return Err(malformed("encrypted assertions are not supported"));
    }
    let mut assertions = doc.children_named(ASSERTION_NS, "Assertion");
    let assertion = assertions
        .next()
        .ok_or_else(|| malformed("response carries no assertion"))?;
    if assertions.next().is_some() {
        return Err(malformed("response carries more than one assertion"));
    }
    require_version(assertion)?;

    verify_signatures(response_xml, &doc, assertion, idp_cert)?;

    check_issuer(&doc, &config.idp.entity_id)?;
    let assertion_issuer = issuer(assertion)
        .ok_or_else(|| malformed("assertion has no Issuer"))?;
    if assertion_issuer != config.idp.entity_id {
        return Err(ValidationError::IssuerMismatch(format!(
            "assertion issued by {:?}, expected {:?}",
            assertion_issuer, config.idp.entity_id
        )));
    }

    let skew = Duration::seconds(config.policy.clock_skew_secs);
    let conditions = assertion.child(ASSERTION_NS, "Conditions");
    let not_on_or_after = match conditions {
        Some(conditions) => check_conditions(conditions, &config.sp.entity_id, now, skew)?,
        None => {
            return Err(ValidationError::AudienceMismatch(
                "assertion has no Conditions".to_string(),
            ))
        }
    };

    check_destination(&doc, &config.sp.acs_url)?;

    let subject = assertion
        .child(ASSERTION_NS, "Subject")
        .ok_or_else(|| malformed("assertion has no Subject"))?;
    let confirmation_in_response_to =
        check_subject_confirmation(subject, &config.sp.acs_url, now, skew)?;

    let name_id_element = subject
        .child(ASSERTION_NS, "NameID")
        .ok_or_else(|| malformed("assertion has no NameID"))?;
    // Kept byte for byte: the same value goes back to the IdP in logout.
    let name_id = name_id_element.text();
    if name_id.trim().is_empty() {
        return Err(malformed("NameID is empty"));
    }

    let in_response_to = match (doc.attr("InResponseTo"), confirmation_in_response_to) {
        (Some(a), Some(b)) if a != b => {
            return Err(malformed(format!(
                "InResponseTo {:?} disagrees with SubjectConfirmationData {:?}",
                a, b
            )))
        }
        (Some(a), _) => Some(a.to_string()),
        (None, b) => b,
    };

    let (session_index, session_not_on_or_after) =
        match assertion.child(ASSERTION_NS, "AuthnStatement") {
            Some(statement) => {
                let until = instant_attr(statement, "SessionNotOnOrAfter")?;
                if until.is_some_and(|t| now - skew >= t) {
                    return Err(ValidationError::ExpiredAssertion(
                        "IdP session already ended".to_string(),
                    ));
                }
                (statement.attr("SessionIndex").map(str::to_string), until)
            }
            None => (None, None),
        };

    Ok(AssertionClaims {
        name_id,
        name_id_format: name_id_element.attr("Format").map(str::to_string),
        session_index,
        attributes: collect_attributes(assertion),
        issuer: assertion_issuer,
        assertion_id: assertion.attr("ID").unwrap_or_default().to_string(),
        in_response_to,
        session_not_on_or_after,
        not_on_or_after,
    })
}

/// The assertion must be covered by a signature on itself or on the
/// enclosing response. Every signature present must verify.
fn verify_signatures(
    source: &str,
    response: &Element,
    assertion: &Element,
    idp_cert: &X509,
) -> Result<(), ValidationError> {
    let response_signed = dsig::is_signed(response);
    let assertion_signed = dsig::is_signed(assertion);

    if !response_signed && !assertion_signed {
        return Err(ValidationError::InvalidSignature(
            "neither the response nor the assertion is signed".to_string(),
        ));
    }
    if response_signed {
        dsig::verify_enveloped(source, response, idp_cert)?;
    }
    if assertion_signed {
        dsig::verify_enveloped(source, assertion, idp_cert)?;
    }
    Ok(())
}

/// Validity window and audience. Returns the window's upper bound.
fn check_conditions(
    conditions: &Element,
    sp_entity_id: &str,
    now: DateTime<Utc>,
    skew: Duration,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    if let Some(not_before) = instant_attr(conditions, "NotBefore")? {
        if now + skew < not_before {
            return Err(ValidationError::NotYetValid(format!(
                "NotBefore {} is in the future",
                format_instant(not_before)
            )));
        }
    }

    let not_on_or_after = instant_attr(conditions, "NotOnOrAfter")?;
    if let Some(until) = not_on_or_after {
        if now - skew >= until {
            return Err(ValidationError::ExpiredAssertion(format!(
                "NotOnOrAfter {} has passed",
                format_instant(until)
            )));
        }
    }

    // Every AudienceRestriction must admit us, and there must be one.
    let mut restrictions = conditions
        .children_named(ASSERTION_NS, "AudienceRestriction")
        .peekable();
    if restrictions.peek().is_none() {
        return Err(ValidationError::AudienceMismatch(
            "assertion has no AudienceRestriction".to_string(),
        ));
    }
    for restriction in restrictions {
        let admitted = restriction
            .children_named(ASSERTION_NS, "Audience")
            .any(|a| a.trimmed_text().as_deref() == Some(sp_entity_id));
        if !admitted {
            return Err(ValidationError::AudienceMismatch(format!(
                "{:?} is not an audience of this assertion",
                sp_entity_id
            )));
        }
    }

    Ok(not_on_or_after)
}

/// Find a bearer SubjectConfirmation addressed to our ACS that is still
/// valid. Returns its InResponseTo.
fn check_subject_confirmation(
    subject: &Element,
    acs_url: &str,
    now: DateTime<Utc>,
    skew: Duration,
) -> Result<Option<String>, ValidationError> {
    let mut last_error = ValidationError::MalformedResponse(
        "no bearer SubjectConfirmation".to_string(),
    );

    for confirmation in subject.children_named(ASSERTION_NS, "SubjectConfirmation") {
        if confirmation.attr("Method") != Some(CM_BEARER) {
            continue;
        }
        let Some(data) = confirmation.child(ASSERTION_NS, "SubjectConfirmationData") else {
            last_error = malformed("bearer confirmation without SubjectConfirmationData");
            continue;
        };

        match data.attr("Recipient") {
            Some(recipient) if recipient == acs_url => {}
            other => {
                last_error = ValidationError::DestinationMismatch(format!(
                    "Recipient {:?}, expected {:?}",
                    other, acs_url
                ));
                continue;
            }
        }

        match instant_attr(data, "NotOnOrAfter")? {
            Some(until) if now - skew < until => {}
            Some(until) => {
                last_error = ValidationError::ExpiredAssertion(format!(
                    "SubjectConfirmationData NotOnOrAfter {} has passed",
                    format_instant(until)
                ));
                continue;
            }
            None => {
                last_error = malformed("bearer confirmation without NotOnOrAfter");
                continue;
            }
        }

        return Ok(data.attr("InResponseTo").map(str::to_string));
    }

    Err(last_error)
}

fn collect_attributes(assertion: &Element) -> HashMap<String, Vec<String>> {
    let mut attributes: HashMap<String, Vec<String>> = HashMap::new();
    for statement in assertion.children_named(ASSERTION_NS, "AttributeStatement") {
        for attribute in statement.children_named(ASSERTION_NS, "Attribute") {
            let Some(name) = attribute.attr("Name") else {
                continue;
            };
            let values = attributes.entry(name.to_string()).or_default();
            for value in attribute.children_named(ASSERTION_NS, "AttributeValue") {
                values.push(value.text().trim().to_string());
            }
        }
    }
    attributes
}
