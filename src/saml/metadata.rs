//! SP metadata (`md:EntityDescriptor`) for registering the app with an IdP.

use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::x509::X509;

use super::config::SamlConfig;
use super::dsig::DSIG_NS;
use super::protocol::{esc, BINDING_HTTP_POST, BINDING_HTTP_REDIRECT, METADATA_NS, PROTOCOL_NS};

/// Render SP metadata.
///
/// The signing certificate is advertised when one is configured, and
/// `AuthnRequestsSigned` follows it.
pub fn render_sp_metadata(config: &SamlConfig, sp_cert: Option<&X509>) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="{}" entityID="{}">
  <md:SPSSODescriptor AuthnRequestsSigned="{}" WantAssertionsSigned="true" protocolSupportEnumeration="{}">"#,
        METADATA_NS,
        esc(&config.sp.entity_id),
        sp_cert.is_some(),
        PROTOCOL_NS
    );

    if let Some(cert) = sp_cert.and_then(|c| c.to_der().ok()) {
        xml.push_str(&format!(
            r#"
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo xmlns:ds="{}">
        <ds:X509Data>
          <ds:X509Certificate>{}</ds:X509Certificate>
        </ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>"#,
            DSIG_NS,
            STANDARD.encode(cert)
        ));
    }

    for binding in [BINDING_HTTP_REDIRECT, BINDING_HTTP_POST] {
        xml.push_str(&format!(
            r#"
    <md:SingleLogoutService Binding="{}" Location="{}"/>"#,
            binding,
            esc(&config.sp.slo_url)
        ));
    }

    xml.push_str(&format!(
        r#"
    <md:NameIDFormat>{}</md:NameIDFormat>
    <md:AssertionConsumerService Binding="{}" Location="{}" index="0" isDefault="true"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#,
        esc(&config.sp.name_id_format),
        BINDING_HTTP_POST,
        esc(&config.sp.acs_url)
    ));

    xml
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::config::test_config;
    use crate::saml::dsig::testing::idp_keys;
    use crate::saml::xml::parse;

    #[test]
    fn test_metadata_without_certificate() {
        let config = test_config("MIIB");
        let xml = render_sp_metadata(&config, None);
        let doc = parse(&xml).unwrap();
        assert!(doc.is(METADATA_NS, "EntityDescriptor"));
        assert_eq!(doc.attr("entityID"), Some("https://app.example.com/saml"));

        let sp = doc.child(METADATA_NS, "SPSSODescriptor").unwrap();
        assert_eq!(sp.attr("AuthnRequestsSigned"), Some("false"));
        assert!(sp.child(METADATA_NS, "KeyDescriptor").is_none());
        assert_eq!(sp.children_named(METADATA_NS, "SingleLogoutService").count(), 2);
        let acs = sp.child(METADATA_NS, "AssertionConsumerService").unwrap();
        assert_eq!(acs.attr("Binding"), Some(BINDING_HTTP_POST));
        assert_eq!(acs.attr("Location"), Some("https://app.example.com/saml/acs"));
    }

    #[test]
    fn test_metadata_with_certificate() {
        let config = test_config("MIIB");
        let xml = render_sp_metadata(&config, Some(&idp_keys().cert));
        let doc = parse(&xml).unwrap();
        let sp = doc.child(METADATA_NS, "SPSSODescriptor").unwrap();
        assert_eq!(sp.attr("AuthnRequestsSigned"), Some("true"));

        let cert_text = sp
            .child(METADATA_NS, "KeyDescriptor")
            .and_then(|k| k.child(DSIG_NS, "KeyInfo"))
            .and_then(|k| k.child(DSIG_NS, "X509Data"))
            .and_then(|k| k.child(DSIG_NS, "X509Certificate"))
            .and_then(|c| c.trimmed_text())
            .unwrap();
        let der = STANDARD.decode(cert_text).unwrap();
        assert_eq!(der, idp_keys().cert.to_der().unwrap());
    }
}
