//! XML Digital Signature verification for enveloped SAML signatures, plus
//! the detached signatures used by the HTTP-Redirect binding.

use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::{PKey, Private};
use openssl::sign::{Signer, Verifier};
use openssl::x509::X509;

use super::error::{bad_signature, ValidationError};
use super::xml::{canonicalize, Element};

pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

/// Signature algorithms accepted from the IdP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    RsaSha1,
    RsaSha256,
    RsaSha384,
    RsaSha512,
}

impl SignatureAlgorithm {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            "http://www.w3.org/2000/09/xmldsig#rsa-sha1" => Some(Self::RsaSha1),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256" => Some(Self::RsaSha256),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384" => Some(Self::RsaSha384),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512" => Some(Self::RsaSha512),
            _ => None,
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            Self::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            Self::RsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            Self::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            Self::RsaSha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
        }
    }

    fn digest(self) -> MessageDigest {
        match self {
            Self::RsaSha1 => MessageDigest::sha1(),
            Self::RsaSha256 => MessageDigest::sha256(),
            Self::RsaSha384 => MessageDigest::sha384(),
            Self::RsaSha512 => MessageDigest::sha512(),
        }
    }
}

fn digest_from_uri(uri: &str) -> Option<MessageDigest> {
    match uri {
        "http://www.w3.org/2000/09/xmldsig#sha1" => Some(MessageDigest::sha1()),
        "http://www.w3.org/2001/04/xmlenc#sha256" => Some(MessageDigest::sha256()),
        "http://www.w3.org/2001/04/xmldsig-more#sha384" => Some(MessageDigest::sha384()),
        "http://www.w3.org/2001/04/xmlenc#sha512" => Some(MessageDigest::sha512()),
        _ => None,
    }
}

/// Parse an X.509 certificate given as PEM or as bare base64 DER (the form
/// IdP metadata and admin consoles usually hand out).
pub fn parse_certificate(pem: &str) -> Result<X509, openssl::error::ErrorStack> {
    if pem.contains("-----BEGIN CERTIFICATE-----") {
        return X509::from_pem(pem.as_bytes());
    }
    let body: String = pem.split_whitespace().collect();
    let wrapped = body
        .as_bytes()
        .chunks(64)
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect::<Vec<_>>()
        .join("\n");
    X509::from_pem(
        format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
            wrapped
        )
        .as_bytes(),
    )
}

/// Whether `element` carries its own enveloped signature.
pub fn is_signed(element: &Element) -> bool {
    element.child(DSIG_NS, "Signature").is_some()
}

/// Verify the enveloped signature that is a direct child of `target`.
///
/// `source` is the document `target` was parsed from. The signature must
/// reference `target` itself by ID, so a valid signature over some other
/// part of the document never vouches for this element. The key comes from
/// the configured certificate; any KeyInfo in the message is ignored.
pub fn verify_enveloped(source: &str, target: &Element, cert: &X509) -> Result<(), ValidationError> {
    let mut signatures = target.children_named(DSIG_NS, "Signature");
    let signature = signatures
        .next()
        .ok_or_else(|| bad_signature(format!("<{}> is not signed", target.name)))?;
    if signatures.next().is_some() {
        return Err(bad_signature("more than one Signature element"));
    }

    let id = target
        .attr("ID")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| bad_signature("signed element has no ID"))?;

    let signed_info = signature
        .child(DSIG_NS, "SignedInfo")
        .ok_or_else(|| bad_signature("missing SignedInfo"))?;

    let c14n_method = signed_info
        .child(DSIG_NS, "CanonicalizationMethod")
        .ok_or_else(|| bad_signature("missing CanonicalizationMethod"))?;
    if c14n_method.attr("Algorithm") != Some(EXC_C14N) {
        return Err(bad_signature(format!(
            "unsupported canonicalization {:?}",
            c14n_method.attr("Algorithm")
        )));
    }
    let signed_info_prefixes = inclusive_prefixes(c14n_method);

    let algorithm = signed_info
        .child(DSIG_NS, "SignatureMethod")
        .and_then(|m| m.attr("Algorithm"))
        .and_then(SignatureAlgorithm::from_uri)
        .ok_or_else(|| bad_signature("unsupported or missing SignatureMethod"))?;

    let mut references = signed_info.children_named(DSIG_NS, "Reference");
    let reference = references
        .next()
        .ok_or_else(|| bad_signature("missing Reference"))?;
    if references.next().is_some() {
        return Err(bad_signature("more than one Reference"));
    }

    let expected_uri = format!("#{}", id);
    if reference.attr("URI") != Some(expected_uri.as_str()) {
        return Err(bad_signature(format!(
            "Reference URI {:?} does not point at {}",
            reference.attr("URI"),
            expected_uri
        )));
    }

    let mut enveloped = false;
    let mut content_prefixes = Vec::new();
    if let Some(transforms) = reference.child(DSIG_NS, "Transforms") {
        for transform in transforms.children_named(DSIG_NS, "Transform") {
            match transform.attr("Algorithm") {
                Some(ENVELOPED_SIGNATURE) => enveloped = true,
                Some(EXC_C14N) => content_prefixes = inclusive_prefixes(transform),
                other => {
                    return Err(bad_signature(format!("unsupported transform {:?}", other)));
                }
            }
        }
    }
    if !enveloped {
        return Err(bad_signature("enveloped-signature transform missing"));
    }

    let digest_method = reference
        .child(DSIG_NS, "DigestMethod")
        .and_then(|m| m.attr("Algorithm"))
        .and_then(digest_from_uri)
        .ok_or_else(|| bad_signature("unsupported or missing DigestMethod"))?;

    let expected_digest = reference
        .child(DSIG_NS, "DigestValue")
        .map(|e| decode_base64(&e.text()))
        .transpose()?
        .ok_or_else(|| bad_signature("missing DigestValue"))?;

    let canonical =
        canonicalize(source, target, Some(signature), &content_prefixes).map_err(bad_signature)?;
    let actual_digest = hash(digest_method, canonical.as_bytes())
        .map_err(|e| bad_signature(format!("digest failed: {}", e)))?;

    if actual_digest.len() != expected_digest.len()
        || !openssl::memcmp::eq(&actual_digest, &expected_digest)
    {
        return Err(bad_signature(format!("digest mismatch for {}", expected_uri)));
    }

    let signature_value = signature
        .child(DSIG_NS, "SignatureValue")
        .map(|e| decode_base64(&e.text()))
        .transpose()?
        .ok_or_else(|| bad_signature("missing SignatureValue"))?;

    let canonical_signed_info =
        canonicalize(source, signed_info, None, &signed_info_prefixes).map_err(bad_signature)?;
    verify_bytes(
        algorithm,
        canonical_signed_info.as_bytes(),
        &signature_value,
        cert,
    )
}

/// Verify a detached signature (HTTP-Redirect binding).
pub fn verify_detached(
    data: &[u8],
    sig_alg_uri: &str,
    signature_b64: &str,
    cert: &X509,
) -> Result<(), ValidationError> {
    let algorithm = SignatureAlgorithm::from_uri(sig_alg_uri)
        .ok_or_else(|| bad_signature(format!("unsupported SigAlg {}", sig_alg_uri)))?;
    let signature = decode_base64(signature_b64)?;
    verify_bytes(algorithm, data, &signature, cert)
}

/// Sign `data` with the SP key (HTTP-Redirect binding).
pub fn sign_detached(
    data: &[u8],
    algorithm: SignatureAlgorithm,
    key: &PKey<Private>,
) -> Result<Vec<u8>, openssl::error::ErrorStack> {
    let mut signer = Signer::new(algorithm.digest(), key)?;
    signer.update(data)?;
    signer.sign_to_vec()
}

fn verify_bytes(
    algorithm: SignatureAlgorithm,
    data: &[u8],
    signature: &[u8],
    cert: &X509,
) -> Result<(), ValidationError> {
    let public_key = cert
        .public_key()
        .map_err(|e| bad_signature(format!("unusable certificate: {}", e)))?;
    let mut verifier = Verifier::new(algorithm.digest(), &public_key)
        .map_err(|e| bad_signature(format!("verifier creation failed: {}", e)))?;
    verifier
        .update(data)
        .map_err(|e| bad_signature(format!("verifier update failed: {}", e)))?;

    // OpenSSL reports a malformed signature as an error rather than `false`.
    match verifier.verify(signature) {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(bad_signature("signature value does not verify")),
    }
}

fn inclusive_prefixes(parent: &Element) -> Vec<String> {
    parent
        .child(EXC_C14N, "InclusiveNamespaces")
        .and_then(|e| e.attr("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn decode_base64(text: &str) -> Result<Vec<u8>, ValidationError> {
    let compact: String = text.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .map_err(|e| bad_signature(format!("invalid base64: {}", e)))
}

/// Key material and signing helpers that play the IdP in tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::saml::xml;
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder};
    use std::sync::OnceLock;

    pub struct TestKeys {
        pub key: PKey<Private>,
        pub cert: X509,
        pub cert_pem: String,
        pub key_pem: String,
    }

    fn generate(common_name: &str) -> TestKeys {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", common_name).unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        let cert_pem = String::from_utf8(cert.to_pem().unwrap()).unwrap();
        let key_pem = String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        TestKeys {
            key,
            cert,
            cert_pem,
            key_pem,
        }
    }

    /// The trusted IdP signing identity.
    pub fn idp_keys() -> &'static TestKeys {
        static KEYS: OnceLock<TestKeys> = OnceLock::new();
        KEYS.get_or_init(|| generate("idp.example.com"))
    }

    /// This application's own signing identity.
    pub fn sp_keys() -> &'static TestKeys {
        static KEYS: OnceLock<TestKeys> = OnceLock::new();
        KEYS.get_or_init(|| generate("app.example.com"))
    }

    /// A well-formed key the SP does not trust.
    pub fn rogue_keys() -> &'static TestKeys {
        static KEYS: OnceLock<TestKeys> = OnceLock::new();
        KEYS.get_or_init(|| generate("rogue.example.com"))
    }

    /// Sign the element with `ID="id"` inside `template`.
    ///
    /// `template` must contain the literal `{signature}` once, as a direct
    /// child position of the element being signed.
    pub fn sign_template(template: &str, id: &str, key: &PKey<Private>) -> String {
        let unsigned = template.replace("{signature}", "");
        let doc = xml::parse(&unsigned).unwrap();
        let target = doc.find_by_id(id).unwrap();
        let digest = hash(
            MessageDigest::sha256(),
            canonicalize(&unsigned, target, None, &[]).unwrap().as_bytes(),
        )
        .unwrap();

        let signature = |digest_b64: &str, value_b64: &str| {
            format!(
                concat!(
                    r#"<ds:Signature xmlns:ds="{ns}"><ds:SignedInfo>"#,
                    r#"<ds:CanonicalizationMethod Algorithm="{c14n}"/>"#,
                    r#"<ds:SignatureMethod Algorithm="{alg}"/>"#,
                    r##"<ds:Reference URI="#{id}"><ds:Transforms>"##,
                    r#"<ds:Transform Algorithm="{env}"/>"#,
                    r#"<ds:Transform Algorithm="{c14n}"/>"#,
                    r#"</ds:Transforms>"#,
                    r#"<ds:DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"/>"#,
                    r#"<ds:DigestValue>{digest}</ds:DigestValue></ds:Reference></ds:SignedInfo>"#,
                    r#"<ds:SignatureValue>{value}</ds:SignatureValue></ds:Signature>"#
                ),
                ns = DSIG_NS,
                c14n = EXC_C14N,
                alg = SignatureAlgorithm::RsaSha256.uri(),
                env = ENVELOPED_SIGNATURE,
                id = id,
                digest = digest_b64,
                value = value_b64,
            )
        };

        let digest_b64 = STANDARD.encode(digest);
        let draft_xml = signature(&digest_b64, "");
        let draft = xml::parse(&draft_xml).unwrap();
        let signed_info = draft.child(DSIG_NS, "SignedInfo").unwrap();
        let value = sign_detached(
            canonicalize(&draft_xml, signed_info, None, &[]).unwrap().as_bytes(),
            SignatureAlgorithm::RsaSha256,
            key,
        )
        .unwrap();

        template.replace(
            "{signature}",
            &signature(&digest_b64, &STANDARD.encode(value)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{idp_keys, rogue_keys, sign_template};
    use super::*;
    use crate::saml::xml::parse;

    const TEMPLATE: &str = r#"<root xmlns="urn:test"><item ID="_i1">
  <name>alice</name>
  {signature}
  <role>admin</role>
</item></root>"#;

    #[test]
    fn test_valid_enveloped_signature() {
        let signed = sign_template(TEMPLATE, "_i1", &idp_keys().key);
        let doc = parse(&signed).unwrap();
        let item = doc.find_by_id("_i1").unwrap();
        assert!(is_signed(item));
        verify_enveloped(&signed, item, &idp_keys().cert).unwrap();
    }

    #[test]
    fn test_tampered_content_fails_digest() {
        let signed = sign_template(TEMPLATE, "_i1", &idp_keys().key)
            .replace("<role>admin</role>", "<role>owner</role>");
        let doc = parse(&signed).unwrap();
        let err = verify_enveloped(&signed, doc.find_by_id("_i1").unwrap(), &idp_keys().cert).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidSignature(ref d) if d.contains("digest")));
    }

    #[test]
    fn test_untrusted_key_fails() {
        let signed = sign_template(TEMPLATE, "_i1", &rogue_keys().key);
        let doc = parse(&signed).unwrap();
        let err = verify_enveloped(&signed, doc.find_by_id("_i1").unwrap(), &idp_keys().cert).unwrap_err();
        assert_eq!(err.category(), "invalid_signature");
    }

    #[test]
    fn test_unsigned_element_is_rejected() {
        let unsigned = TEMPLATE.replace("{signature}", "");
        let doc = parse(&unsigned).unwrap();
        let item = doc.find_by_id("_i1").unwrap();
        assert!(!is_signed(item));
        assert!(verify_enveloped(&unsigned, item, &idp_keys().cert).is_err());
    }

    #[test]
    fn test_crlf_in_transit_still_verifies() {
        // Signed over LF line endings, delivered with CRLF.
        let signed = sign_template(TEMPLATE, "_i1", &idp_keys().key).replace('\n', "\r\n");
        let doc = parse(&signed).unwrap();
        verify_enveloped(&signed, doc.find_by_id("_i1").unwrap(), &idp_keys().cert).unwrap();
    }

    #[test]
    fn test_signature_over_nested_element_with_inherited_namespace() {
        let template = r#"<outer xmlns="urn:outer" xmlns:t="urn:test"><t:item ID="_n1" t:kind="x">{signature}<t:v>1</t:v></t:item></outer>"#;
        let signed = sign_template(template, "_n1", &idp_keys().key);
        let doc = parse(&signed).unwrap();
        verify_enveloped(&signed, doc.find_by_id("_n1").unwrap(), &idp_keys().cert).unwrap();

        let moved = signed.replace("xmlns:t=\"urn:test\"", "xmlns:t=\"urn:other\"");
        let doc = parse(&moved).unwrap();
        assert!(verify_enveloped(&moved, doc.find_by_id("_n1").unwrap(), &idp_keys().cert).is_err());
    }

    #[test]
    fn test_reference_must_point_at_signed_element() {
        let signed = sign_template(TEMPLATE, "_i1", &idp_keys().key).replace("ID=\"_i1\"", "ID=\"_i2\"");
        let doc = parse(&signed).unwrap();
        let err = verify_enveloped(&signed, doc.find_by_id("_i2").unwrap(), &idp_keys().cert).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidSignature(ref d) if d.contains("Reference URI")));
    }

    #[test]
    fn test_detached_round_trip() {
        let data = b"SAMLRequest=abc&SigAlg=x";
        let sig = sign_detached(data, SignatureAlgorithm::RsaSha256, &idp_keys().key).unwrap();
        let sig_b64 = STANDARD.encode(sig);
        verify_detached(data, SignatureAlgorithm::RsaSha256.uri(), &sig_b64, &idp_keys().cert)
            .unwrap();
        assert!(verify_detached(
            b"SAMLRequest=abd&SigAlg=x",
            SignatureAlgorithm::RsaSha256.uri(),
            &sig_b64,
            &idp_keys().cert
        )
        .is_err());
        assert!(verify_detached(data, "urn:unknown", &sig_b64, &idp_keys().cert).is_err());
    }

    #[test]
    fn test_parse_certificate_accepts_bare_base64() {
        let pem = &idp_keys().cert_pem;
        let bare: String = pem
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect();
        let cert = parse_certificate(&bare).unwrap();
        assert_eq!(cert.to_der().unwrap(), idp_keys().cert.to_der().unwrap());
        assert!(parse_certificate("not a certificate").is_err());
    }
}
