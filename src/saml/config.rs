//! Service provider and identity provider configuration.

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::AuthError;

pub const NAMEID_FORMAT_UNSPECIFIED: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";

/// This application, as the IdP sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceProviderConfig {
    /// SP Entity ID (unique identifier for this service provider).
    pub entity_id: String,

    /// Assertion Consumer Service URL (where the IdP posts the response).
    pub acs_url: String,

    /// Single Logout Service URL (where the IdP sends logout traffic).
    pub slo_url: String,

    /// NameID format to request.
    #[serde(default = "default_name_id_format")]
    pub name_id_format: String,

    /// Send RequestedAuthnContext. Off by default so passwordless and
    /// federated IdPs can choose their own authentication context.
    #[serde(default)]
    pub requested_authn_context: bool,

    /// SP private key (PEM) for signing redirect-binding messages.
    #[serde(default)]
    pub private_key_pem: Option<String>,

    /// SP certificate (PEM), advertised in metadata.
    #[serde(default)]
    pub certificate_pem: Option<String>,
}

/// The external identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityProviderConfig {
    pub entity_id: String,

    pub sso_url: String,

    #[serde(default)]
    pub slo_url: Option<String>,

    /// IdP signing certificate (PEM, or bare base64 DER).
    pub certificate_pem: String,
}

/// How strictly inbound messages are checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPolicy {
    /// Enforce InResponseTo correlation, replay prevention and signed
    /// logout messages. Turning this off is a reduced-security mode.
    #[serde(default = "default_true")]
    pub strict: bool,

    /// Clock skew tolerance in seconds.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,
}

fn default_name_id_format() -> String {
    NAMEID_FORMAT_UNSPECIFIED.to_string()
}

fn default_true() -> bool {
    true
}

fn default_clock_skew() -> i64 {
    180 // 3 minutes
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            strict: true,
            clock_skew_secs: default_clock_skew(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamlConfig {
    pub sp: ServiceProviderConfig,
    pub idp: IdentityProviderConfig,
    #[serde(default)]
    pub policy: ValidationPolicy,
}

impl SamlConfig {
    /// Validate the configuration. Failures are fatal at startup.
    pub fn validate(&self) -> Result<(), AuthError> {
        require_url("SP entity ID", &self.sp.entity_id, false)?;
        require_url("SP ACS URL", &self.sp.acs_url, true)?;
        require_url("SP SLS URL", &self.sp.slo_url, true)?;
        require_url("IdP entity ID", &self.idp.entity_id, false)?;
        require_url("IdP SSO URL", &self.idp.sso_url, true)?;

        if let Some(ref slo) = self.idp.slo_url {
            require_url("IdP SLO URL", slo, true)?;
        }

        if self.idp.certificate_pem.trim().is_empty() {
            return Err(AuthError::Configuration(
                "IdP signing certificate is required".to_string(),
            ));
        }

        let has_sp_key = self
            .sp
            .private_key_pem
            .as_deref()
            .is_some_and(|pem| !pem.trim().is_empty());
        if self.sp.certificate_pem.is_some() && !has_sp_key {
            return Err(AuthError::Configuration(
                "SP certificate configured without its private key".to_string(),
            ));
        }

        // LogoutRequests go out over the redirect binding and must be signed.
        if self.slo_enabled() && !has_sp_key {
            return Err(AuthError::Configuration(
                "IdP SLO URL configured without an SP private key to sign logout messages"
                    .to_string(),
            ));
        }

        if self.policy.clock_skew_secs < 0 {
            return Err(AuthError::Configuration(
                "clock skew must not be negative".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether SP-initiated Single Logout is possible.
    pub fn slo_enabled(&self) -> bool {
        self.idp.slo_url.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// Path component of the ACS URL (e.g. "/saml/acs").
    pub fn acs_path(&self) -> String {
        path_of(&self.sp.acs_url)
    }

    /// Path component of the SLS URL (e.g. "/logout").
    pub fn slo_path(&self) -> String {
        path_of(&self.sp.slo_url)
    }

    /// Origin the application is served from, derived from the ACS URL.
    pub fn app_origin(&self) -> Option<url::Origin> {
        Url::parse(&self.sp.acs_url).ok().map(|u| u.origin())
    }
}

fn path_of(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

/// Entity IDs may be URNs; endpoints must be absolute http(s) URLs.
fn require_url(what: &str, value: &str, endpoint: bool) -> Result<(), AuthError> {
    if value.trim().is_empty() {
        return Err(AuthError::Configuration(format!("{} is required", what)));
    }
    if endpoint {
        let parsed = Url::parse(value)
            .map_err(|e| AuthError::Configuration(format!("{} is not a URL: {}", what, e)))?;
        if parsed.scheme() != "https" && parsed.scheme() != "http" {
            return Err(AuthError::Configuration(format!(
                "{} must be an http(s) URL",
                what
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_config(idp_certificate_pem: &str) -> SamlConfig {
    SamlConfig {
        sp: ServiceProviderConfig {
            entity_id: "https://app.example.com/saml".to_string(),
            acs_url: "https://app.example.com/saml/acs".to_string(),
            slo_url: "https://app.example.com/logout".to_string(),
            name_id_format: default_name_id_format(),
            requested_authn_context: false,
            private_key_pem: Some(crate::saml::dsig::testing::sp_keys().key_pem.clone()),
            certificate_pem: None,
        },
        idp: IdentityProviderConfig {
            entity_id: "https://idp.example.com/metadata".to_string(),
            sso_url: "https://idp.example.com/sso".to_string(),
            slo_url: Some("https://idp.example.com/slo".to_string()),
            certificate_pem: idp_certificate_pem.to_string(),
        },
        policy: ValidationPolicy::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_strict() {
        let policy = ValidationPolicy::default();
        assert!(policy.strict);
        assert_eq!(policy.clock_skew_secs, 180);
    }

    #[test]
    fn test_validation() {
        let mut config = test_config("MIIB");
        assert!(config.validate().is_ok());

        config.idp.certificate_pem = String::new();
        assert!(matches!(
            config.validate(),
            Err(AuthError::Configuration(_))
        ));

        config.idp.certificate_pem = "MIIB".to_string();
        config.idp.sso_url = "not a url".to_string();
        assert!(config.validate().is_err());

        config.idp.sso_url = "https://idp.example.com/sso".to_string();
        config.sp.entity_id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_single_logout_requires_signing_key() {
        let mut config = test_config("MIIB");
        config.sp.private_key_pem = None;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AuthError::Configuration(ref m) if m.contains("SLO")));

        config.sp.private_key_pem = Some("  ".to_string());
        assert!(config.validate().is_err());

        // Without SLO nothing needs signing.
        config.idp.slo_url = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_urn_entity_id_is_accepted() {
        let mut config = test_config("MIIB");
        config.sp.entity_id = "gold-star-app-local".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_paths_and_origin() {
        let mut config = test_config("MIIB");
        assert_eq!(config.acs_path(), "/saml/acs");
        assert_eq!(config.slo_path(), "/logout");
        assert_eq!(
            config.app_origin(),
            Url::parse("https://app.example.com/").ok().map(|u| u.origin())
        );
        assert!(config.slo_enabled());
        config.idp.slo_url = None;
        assert!(!config.slo_enabled());
    }

    #[test]
    fn test_requested_authn_context_defaults_off() {
        let json = r#"{
            "entity_id": "sp",
            "acs_url": "https://app.example.com/saml/acs",
            "slo_url": "https://app.example.com/logout"
        }"#;
        let sp: ServiceProviderConfig = serde_json::from_str(json).unwrap();
        assert!(!sp.requested_authn_context);
        assert_eq!(sp.name_id_format, NAMEID_FORMAT_UNSPECIFIED);
    }
}
