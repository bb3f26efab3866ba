//! HTTP-Redirect and HTTP-POST binding encodings.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use std::io::{Read, Write};
use url::form_urlencoded;

use super::dsig::{self, SignatureAlgorithm};
use super::error::{bad_signature, malformed, ValidationError};

/// Upper bound on a decoded protocol message. Inflation stops here so a
/// small compressed payload cannot expand without limit.
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Which query parameter carries the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageParam {
    Request,
    Response,
}

impl MessageParam {
    pub fn name(self) -> &'static str {
        match self {
            MessageParam::Request => "SAMLRequest",
            MessageParam::Response => "SAMLResponse",
        }
    }
}

/// DEFLATE compress then base64 encode (HTTP-Redirect binding).
pub fn deflate_and_encode(xml: &str) -> Result<String> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .context("Failed to deflate SAML message")?;
    let compressed = encoder.finish().context("Failed to deflate SAML message")?;
    Ok(STANDARD.encode(compressed))
}

/// Base64 decode then inflate (HTTP-Redirect binding).
pub fn decode_and_inflate(encoded: &str) -> Result<String, ValidationError> {
    let compressed = decode_base64(encoded)?;
    let mut inflated = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .take(MAX_MESSAGE_BYTES as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| malformed(format!("inflate failed: {}", e)))?;
    if inflated.len() > MAX_MESSAGE_BYTES {
        return Err(malformed("inflated message exceeds size limit"));
    }
    String::from_utf8(inflated).map_err(|e| malformed(format!("message is not UTF-8: {}", e)))
}

/// Base64 decode a message (HTTP-POST binding).
pub fn decode_post(encoded: &str) -> Result<String, ValidationError> {
    let bytes = decode_base64(encoded)?;
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(malformed("message exceeds size limit"));
    }
    String::from_utf8(bytes).map_err(|e| malformed(format!("message is not UTF-8: {}", e)))
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>, ValidationError> {
    let compact: String = encoded.split_whitespace().collect();
    if compact.is_empty() {
        return Err(malformed("empty SAML message"));
    }
    if compact.len() > MAX_MESSAGE_BYTES * 4 / 3 + 4 {
        return Err(malformed("encoded message exceeds size limit"));
    }
    STANDARD
        .decode(compact)
        .map_err(|e| malformed(format!("invalid base64: {}", e)))
}

/// Build an HTTP-Redirect binding URL.
///
/// With a signing key the query gets `SigAlg` and `Signature`, computed over
/// the exact encoded `param=..&RelayState=..&SigAlg=..` string.
pub fn build_redirect_url(
    endpoint: &str,
    param: MessageParam,
    xml: &str,
    relay_state: Option<&str>,
    signing_key: Option<&PKey<Private>>,
) -> Result<String> {
    let encoded = deflate_and_encode(xml)?;

    let mut query = format!("{}={}", param.name(), urlencoding::encode(&encoded));
    if let Some(rs) = relay_state.filter(|rs| !rs.is_empty()) {
        query.push_str("&RelayState=");
        query.push_str(&urlencoding::encode(rs));
    }

    if let Some(key) = signing_key {
        let algorithm = SignatureAlgorithm::RsaSha256;
        query.push_str("&SigAlg=");
        query.push_str(&urlencoding::encode(algorithm.uri()));

        let signature = dsig::sign_detached(query.as_bytes(), algorithm, key)
            .context("Failed to sign redirect binding query")?;
        query.push_str("&Signature=");
        query.push_str(&urlencoding::encode(&STANDARD.encode(signature)));
    }

    let separator = if endpoint.contains('?') { '&' } else { '?' };
    Ok(format!("{}{}{}", endpoint, separator, query))
}

/// One query parameter, kept both raw and decoded.
#[derive(Debug, Clone)]
struct QueryField {
    name: String,
    raw: String,
    value: String,
}

/// Query string of an inbound HTTP-Redirect binding message.
///
/// Signature verification needs the parameters exactly as the IdP encoded
/// them, so the raw text is retained next to the decoded value.
#[derive(Debug, Clone, Default)]
pub struct RedirectQuery {
    fields: Vec<QueryField>,
}

impl RedirectQuery {
    pub fn parse(raw_query: &str) -> Self {
        let fields = raw_query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter_map(|pair| {
                let raw_value = pair.split_once('=').map(|(_, v)| v).unwrap_or("");
                let (name, value) = form_urlencoded::parse(pair.as_bytes()).next()?;
                Some(QueryField {
                    name: name.into_owned(),
                    raw: raw_value.to_string(),
                    value: value.into_owned(),
                })
            })
            .collect();
        Self { fields }
    }

    fn field(&self, name: &str) -> Option<&QueryField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.field(name).map(|f| f.value.as_str())
    }

    /// The SAML message parameter present, if any. Requests win when a
    /// malformed query carries both.
    pub fn message(&self) -> Option<(MessageParam, &str)> {
        if let Some(v) = self.get(MessageParam::Request.name()) {
            return Some((MessageParam::Request, v));
        }
        self.get(MessageParam::Response.name())
            .map(|v| (MessageParam::Response, v))
    }

    pub fn relay_state(&self) -> Option<&str> {
        self.get("RelayState").filter(|rs| !rs.is_empty())
    }

    pub fn is_signed(&self) -> bool {
        self.field("Signature").is_some()
    }

    /// Verify the detached query signature against the IdP certificate.
    ///
    /// Returns `Ok(false)` when the query carries no signature at all.
    pub fn verify_signature(&self, param: MessageParam, cert: &X509) -> Result<bool, ValidationError> {
        let Some(signature) = self.get("Signature") else {
            return Ok(false);
        };
        let sig_alg = self
            .field("SigAlg")
            .ok_or_else(|| bad_signature("Signature without SigAlg"))?;
        let message = self
            .field(param.name())
            .ok_or_else(|| malformed(format!("missing {}", param.name())))?;

        let mut signed = format!("{}={}", param.name(), message.raw);
        if let Some(rs) = self.field("RelayState") {
            signed.push_str("&RelayState=");
            signed.push_str(&rs.raw);
        }
        signed.push_str("&SigAlg=");
        signed.push_str(&sig_alg.raw);

        dsig::verify_detached(signed.as_bytes(), &sig_alg.value, signature, cert)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::dsig::testing::{idp_keys, rogue_keys};

    const XML: &str = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_x"/>"#;

    fn query_of(url: &str) -> &str {
        url.split_once('?').map(|(_, q)| q).unwrap()
    }

    #[test]
    fn test_redirect_url_round_trip() {
        let url = build_redirect_url(
            "https://idp.example.com/sso",
            MessageParam::Request,
            XML,
            Some("/dashboard?tab=1"),
            None,
        )
        .unwrap();
        assert!(url.starts_with("https://idp.example.com/sso?SAMLRequest="));

        let query = RedirectQuery::parse(query_of(&url));
        let (param, encoded) = query.message().unwrap();
        assert_eq!(param, MessageParam::Request);
        assert_eq!(decode_and_inflate(encoded).unwrap(), XML);
        assert_eq!(query.relay_state(), Some("/dashboard?tab=1"));
        assert!(!query.is_signed());
        assert!(!query
            .verify_signature(MessageParam::Request, &idp_keys().cert)
            .unwrap());
    }

    #[test]
    fn test_endpoint_with_existing_query() {
        let url = build_redirect_url(
            "https://idp.example.com/sso?tenant=t1",
            MessageParam::Request,
            XML,
            None,
            None,
        )
        .unwrap();
        assert!(url.starts_with("https://idp.example.com/sso?tenant=t1&SAMLRequest="));
        assert!(!url.contains("RelayState"));
    }

    #[test]
    fn test_signed_redirect_verifies() {
        let url = build_redirect_url(
            "https://app.example.com/logout",
            MessageParam::Response,
            XML,
            Some("state 1"),
            Some(&idp_keys().key),
        )
        .unwrap();
        let query = RedirectQuery::parse(query_of(&url));
        assert!(query.is_signed());
        assert!(query
            .verify_signature(MessageParam::Response, &idp_keys().cert)
            .unwrap());
        assert!(query
            .verify_signature(MessageParam::Response, &rogue_keys().cert)
            .is_err());
    }

    #[test]
    fn test_tampered_relay_state_fails() {
        let url = build_redirect_url(
            "https://app.example.com/logout",
            MessageParam::Response,
            XML,
            Some("a"),
            Some(&idp_keys().key),
        )
        .unwrap()
        .replace("RelayState=a", "RelayState=b");
        let query = RedirectQuery::parse(query_of(&url));
        let err = query
            .verify_signature(MessageParam::Response, &idp_keys().cert)
            .unwrap_err();
        assert_eq!(err.category(), "invalid_signature");
    }

    #[test]
    fn test_inflate_is_capped() {
        let huge = "a".repeat(MAX_MESSAGE_BYTES + 10);
        let encoded = deflate_and_encode(&huge).unwrap();
        let err = decode_and_inflate(&encoded).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedResponse(ref d) if d.contains("size limit")));
    }

    #[test]
    fn test_bad_encodings_are_malformed() {
        assert!(decode_and_inflate("!!!not base64").is_err());
        assert!(decode_and_inflate(&STANDARD.encode(b"not deflate data")).is_err());
        assert!(decode_post("").is_err());
        assert_eq!(
            decode_post(&STANDARD.encode("<a/>")).unwrap(),
            "<a/>"
        );
    }

    #[test]
    fn test_post_decode_tolerates_line_breaks() {
        let encoded = STANDARD.encode("<samlp:Response/>");
        let (a, b) = encoded.split_at(6);
        assert_eq!(
            decode_post(&format!("{}\r\n{}", a, b)).unwrap(),
            "<samlp:Response/>"
        );
    }
}
