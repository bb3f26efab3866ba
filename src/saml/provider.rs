//! SAML Service Provider implementation.
//!
//! Builds outbound protocol messages and validates inbound ones. Holds no
//! per-login state; correlation lives with the auth flow.

use chrono::{DateTime, Utc};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tracing::{debug, info, warn};

use super::authn::{parse_authn_response, render_authn_request};
use super::binding::{build_redirect_url, decode_post, MessageParam};
use super::claims::AssertionClaims;
use super::config::SamlConfig;
use super::dsig::parse_certificate;
use super::error::{AuthError, AuthResult, ValidationError};
use super::logout::{
    parse_logout_request, parse_logout_response, render_logout_request, render_logout_response,
    InboundMessage, LogoutRequestInfo, LogoutResponseInfo,
};
use super::metadata::render_sp_metadata;
use super::protocol::new_message_id;

/// An outbound redirect and the ID of the request it carries.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub redirect_url: String,
    pub request_id: String,
}

/// SAML Service Provider that handles authentication.
pub struct SamlProvider {
    config: SamlConfig,
    idp_cert: X509,
    sp_key: Option<PKey<Private>>,
    sp_cert: Option<X509>,
}

impl SamlProvider {
    /// Create a provider. Any configuration problem is fatal.
    pub fn new(config: SamlConfig) -> AuthResult<Self> {
        config.validate()?;

        let idp_cert = parse_certificate(&config.idp.certificate_pem).map_err(|e| {
            AuthError::Configuration(format!("invalid IdP certificate: {}", e))
        })?;

        let sp_key = config
            .sp
            .private_key_pem
            .as_deref()
            .map(|pem| PKey::private_key_from_pem(pem.as_bytes()))
            .transpose()
            .map_err(|e| AuthError::Configuration(format!("invalid SP private key: {}", e)))?;

        let sp_cert = config
            .sp
            .certificate_pem
            .as_deref()
            .map(parse_certificate)
            .transpose()
            .map_err(|e| AuthError::Configuration(format!("invalid SP certificate: {}", e)))?;

        info!(
            sp = %config.sp.entity_id,
            idp = %config.idp.entity_id,
            signing = sp_key.is_some(),
            slo = config.slo_enabled(),
            strict = config.policy.strict,
            "SAML provider configured"
        );

        Ok(Self {
            config,
            idp_cert,
            sp_key,
            sp_cert,
        })
    }

    pub fn config(&self) -> &SamlConfig {
        &self.config
    }

    pub fn is_strict(&self) -> bool {
        self.config.policy.strict
    }

    /// Create an AuthnRequest and return the redirect to the IdP.
    pub fn build_authn_request(&self, relay_state: Option<&str>) -> AuthResult<OutboundRequest> {
        let request_id = new_message_id();
        let xml = render_authn_request(&self.config, &request_id, Utc::now());

        let redirect_url = build_redirect_url(
            &self.config.idp.sso_url,
            MessageParam::Request,
            &xml,
            relay_state,
            self.sp_key.as_ref(),
        )
        .map_err(|e| AuthError::Configuration(format!("{:#}", e)))?;

        debug!(request_id = %request_id, "Created SAML AuthnRequest redirect");
        Ok(OutboundRequest {
            redirect_url,
            request_id,
        })
    }

    /// Validate a base64 `SAMLResponse` posted to the ACS.
    pub fn parse_authn_response(&self, saml_response: &str) -> Result<AssertionClaims, ValidationError> {
        self.parse_authn_response_at(saml_response, Utc::now())
    }

    pub fn parse_authn_response_at(
        &self,
        saml_response: &str,
        now: DateTime<Utc>,
    ) -> Result<AssertionClaims, ValidationError> {
        let xml = decode_post(saml_response)?;
        let claims = parse_authn_response(&xml, &self.config, &self.idp_cert, now)?;

        info!(
            name_id = %claims.name_id,
            idp = %claims.issuer,
            attributes = claims.attributes.len(),
            "SAML assertion validated"
        );
        Ok(claims)
    }

    /// Create a LogoutRequest for the given subject.
    pub fn build_logout_request(
        &self,
        name_id: &str,
        name_id_format: Option<&str>,
        session_index: Option<&str>,
        relay_state: Option<&str>,
    ) -> AuthResult<OutboundRequest> {
        let slo_url = self.idp_slo_url()?;
        let request_id = new_message_id();
        let xml = render_logout_request(
            &self.config,
            slo_url,
            &request_id,
            Utc::now(),
            name_id,
            name_id_format,
            session_index,
        );

        let redirect_url = build_redirect_url(
            slo_url,
            MessageParam::Request,
            &xml,
            relay_state,
            self.sp_key.as_ref(),
        )
        .map_err(|e| AuthError::Configuration(format!("{:#}", e)))?;

        debug!(request_id = %request_id, name_id = %name_id, "Created SAML LogoutRequest redirect");
        Ok(OutboundRequest {
            redirect_url,
            request_id,
        })
    }

    pub fn parse_logout_response(
        &self,
        message: InboundMessage<'_>,
    ) -> Result<LogoutResponseInfo, ValidationError> {
        let info = parse_logout_response(message, &self.config, &self.idp_cert)?;
        debug!(id = %info.id, in_response_to = ?info.in_response_to, "SAML LogoutResponse validated");
        Ok(info)
    }

    pub fn parse_logout_request(
        &self,
        message: InboundMessage<'_>,
    ) -> Result<LogoutRequestInfo, ValidationError> {
        let info = parse_logout_request(message, &self.config, &self.idp_cert, Utc::now())?;
        debug!(id = %info.id, name_id = %info.name_id, "SAML LogoutRequest validated");
        Ok(info)
    }

    /// Answer an IdP-initiated LogoutRequest.
    pub fn build_logout_response(
        &self,
        in_response_to: &str,
        status: &str,
        relay_state: Option<&str>,
    ) -> AuthResult<String> {
        let slo_url = self.idp_slo_url()?;
        let xml = render_logout_response(
            &self.config,
            slo_url,
            &new_message_id(),
            Utc::now(),
            in_response_to,
            status,
        );
        build_redirect_url(
            slo_url,
            MessageParam::Response,
            &xml,
            relay_state,
            self.sp_key.as_ref(),
        )
        .map_err(|e| AuthError::Configuration(format!("{:#}", e)))
    }

    pub fn metadata(&self) -> String {
        if self.sp_key.is_some() && self.sp_cert.is_none() {
            warn!("SP signing key configured without a certificate; metadata omits it");
        }
        render_sp_metadata(&self.config, self.sp_cert.as_ref())
    }

    fn idp_slo_url(&self) -> AuthResult<&str> {
        self.config
            .idp
            .slo_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AuthError::Configuration("IdP SLO URL not configured".to_string()))
    }
}
