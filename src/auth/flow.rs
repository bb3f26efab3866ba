//! Login, assertion consumer and logout orchestration.
//!
//! Each public method is one transition of the browser's SSO state machine.
//! The controller owns request correlation; message validation is delegated
//! to [`SamlProvider`] and persistence to the session store.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::directory::UserProvisioner;
use crate::saml::protocol::STATUS_SUCCESS;
use crate::saml::{
    AuthError, AuthResult, InboundMessage, PendingRequest, RequestTracker, SamlProvider,
    ValidationError,
};
use crate::session::{Session, SessionStore, SessionToken};

pub const LOGIN_PATH: &str = "/login";
pub const HOME_PATH: &str = "/";

/// How long an issued request may wait for its response.
const REQUEST_TTL_SECS: u64 = 600;

/// Replay records outlive assertions that carry no NotOnOrAfter by this much.
const DEFAULT_REPLAY_WINDOW_MINUTES: i64 = 60;

/// What a request to the logout endpoint is, decided by which SAML
/// parameter it carries.
#[derive(Debug, Clone, Copy)]
pub enum LogoutDispatch<'a> {
    /// No SAML parameter: the user clicked "log out".
    Initiate,
    /// `SAMLResponse`: the IdP confirming our LogoutRequest.
    Complete(InboundMessage<'a>),
    /// `SAMLRequest`: the IdP asking us to end the subject's sessions.
    IdpInitiated {
        message: InboundMessage<'a>,
        relay_state: Option<&'a str>,
    },
}

/// Successful assertion consumer outcome.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub session: Session,
    pub redirect_url: String,
}

/// Where the browser goes after a logout step and whether its cookie dies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutOutcome {
    pub redirect_url: String,
    pub clear_cookie: bool,
}

impl LogoutOutcome {
    fn to_login(clear_cookie: bool) -> Self {
        Self {
            redirect_url: LOGIN_PATH.to_string(),
            clear_cookie,
        }
    }
}

pub struct AuthFlow {
    provider: SamlProvider,
    sessions: Arc<SessionStore>,
    provisioner: Arc<dyn UserProvisioner>,
    tracker: RequestTracker,
}

impl AuthFlow {
    pub fn new(
        provider: SamlProvider,
        sessions: Arc<SessionStore>,
        provisioner: Arc<dyn UserProvisioner>,
    ) -> Self {
        Self {
            provider,
            sessions,
            provisioner,
            tracker: RequestTracker::new(std::time::Duration::from_secs(REQUEST_TTL_SECS)),
        }
    }

    pub fn provider(&self) -> &SamlProvider {
        &self.provider
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// The live session behind a cookie token, if any.
    pub fn current_session(&self, token: Option<SessionToken>) -> AuthResult<Option<Session>> {
        match token {
            Some(token) => self.sessions.lookup(token).map_err(AuthError::Storage),
            None => Ok(None),
        }
    }

    /// Start SP-initiated SSO. Returns the IdP redirect.
    pub fn login(&self, next: Option<&str>) -> AuthResult<String> {
        let relay_state = self.safe_redirect(next);
        let request = self.provider.build_authn_request(Some(&relay_state))?;
        self.tracker
            .record(&request.request_id, PendingRequest::Login)
            .map_err(AuthError::Storage)?;

        debug!(
            request_id = %request.request_id,
            relay_state = %relay_state,
            outstanding = self.tracker.len(),
            "Login started"
        );
        Ok(request.redirect_url)
    }

    /// Consume a posted `SAMLResponse`: validate, provision, open a session.
    pub fn assertion_consumer(
        &self,
        saml_response: &str,
        relay_state: Option<&str>,
    ) -> AuthResult<LoginOutcome> {
        let claims = self
            .provider
            .parse_authn_response(saml_response)
            .inspect_err(|e| warn!(category = e.category(), error = %e, "Rejected SAML response"))?;

        let replay_until = claims
            .not_on_or_after
            .unwrap_or_else(|| Utc::now() + Duration::minutes(DEFAULT_REPLAY_WINDOW_MINUTES));
        let fresh = self
            .sessions
            .mark_assertion_used(&claims.assertion_id, replay_until)
            .map_err(AuthError::Storage)?;
        if !fresh {
            self.enforce(ValidationError::ReplayDetected(format!(
                "assertion {} was already consumed",
                claims.assertion_id
            )))?;
        }

        match claims.in_response_to.as_deref() {
            Some(id) => match self.tracker.take(id).map_err(AuthError::Storage)? {
                Some(PendingRequest::Login) => {}
                _ => self.enforce(ValidationError::UnsolicitedResponse(format!(
                    "InResponseTo {} matches no outstanding AuthnRequest",
                    id
                )))?,
            },
            None => self.enforce(ValidationError::UnsolicitedResponse(
                "IdP-initiated response".to_string(),
            ))?,
        }

        let display_name = claims.display_name();
        let user = self
            .provisioner
            .upsert(&claims.name_id, &display_name)
            .map_err(|e| {
                warn!(name_id = %claims.name_id, error = %e, "User provisioning failed");
                AuthError::Provisioning(e)
            })?;

        let session = self.sessions.create(claims).map_err(AuthError::Storage)?;
        info!(user = %user.email, "User logged in");

        Ok(LoginOutcome {
            redirect_url: self.safe_redirect(relay_state),
            session,
        })
    }

    /// Handle any request to the logout endpoint.
    pub fn logout(
        &self,
        token: Option<SessionToken>,
        dispatch: LogoutDispatch<'_>,
    ) -> AuthResult<LogoutOutcome> {
        match dispatch {
            LogoutDispatch::Initiate => Ok(self.initiate_logout(token)),
            LogoutDispatch::Complete(message) => Ok(self.complete_logout(token, message)),
            LogoutDispatch::IdpInitiated {
                message,
                relay_state,
            } => self.idp_initiated_logout(message, relay_state),
        }
    }

    fn initiate_logout(&self, token: Option<SessionToken>) -> LogoutOutcome {
        let session = match self.current_session(token) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Session lookup failed during logout");
                None
            }
        };

        let (Some(session), true) = (session, self.provider.config().slo_enabled()) else {
            self.revoke_quietly(token);
            return LogoutOutcome::to_login(true);
        };

        // The request is built from the session before anything is cleared.
        let claims = &session.claims;
        let request = self
            .provider
            .build_logout_request(
                &claims.name_id,
                claims.name_id_format.as_deref(),
                claims.session_index.as_deref(),
                None,
            )
            .and_then(|request| {
                self.tracker
                    .record(
                        &request.request_id,
                        PendingRequest::Logout {
                            session: Some(session.token.to_hex()),
                        },
                    )
                    .map_err(AuthError::Storage)?;
                Ok(request)
            });

        match request {
            Ok(request) => {
                debug!(request_id = %request.request_id, "Logout sent to IdP");
                LogoutOutcome {
                    redirect_url: request.redirect_url,
                    clear_cookie: false,
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not start Single Logout; ending local session only");
                self.revoke_quietly(token);
                LogoutOutcome::to_login(true)
            }
        }
    }

    fn complete_logout(
        &self,
        token: Option<SessionToken>,
        message: InboundMessage<'_>,
    ) -> LogoutOutcome {
        let response = match self.provider.parse_logout_response(message) {
            Ok(response) => response,
            Err(e) => {
                warn!(category = e.category(), error = %e, "Rejected LogoutResponse; session kept");
                return LogoutOutcome::to_login(false);
            }
        };

        let pending = match response.in_response_to.as_deref() {
            Some(id) => self.tracker.take(id).unwrap_or_else(|e| {
                warn!(error = %e, "Request tracker unavailable");
                None
            }),
            None => None,
        };

        let recorded_session = match pending {
            Some(PendingRequest::Logout { session }) => session,
            _ => {
                let err = ValidationError::UnsolicitedResponse(format!(
                    "LogoutResponse InResponseTo {:?} matches no outstanding LogoutRequest",
                    response.in_response_to
                ));
                if let Err(e) = self.enforce(err) {
                    warn!(error = %e, "Rejected LogoutResponse; session kept");
                    return LogoutOutcome::to_login(false);
                }
                None
            }
        };

        if let Some(recorded) = recorded_session.as_deref().and_then(SessionToken::from_hex) {
            self.revoke_quietly(Some(recorded));
        }
        self.revoke_quietly(token);

        info!("Single Logout completed");
        LogoutOutcome::to_login(true)
    }

    fn idp_initiated_logout(
        &self,
        message: InboundMessage<'_>,
        relay_state: Option<&str>,
    ) -> AuthResult<LogoutOutcome> {
        let request = self
            .provider
            .parse_logout_request(message)
            .inspect_err(|e| warn!(category = e.category(), error = %e, "Rejected LogoutRequest"))?;

        let revoked = self
            .sessions
            .revoke_by_name_id(&request.name_id, &request.session_indexes)
            .map_err(AuthError::Storage)?;
        info!(name_id = %request.name_id, revoked, "IdP-initiated logout");

        let redirect_url = self
            .provider
            .build_logout_response(&request.id, STATUS_SUCCESS, relay_state)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Cannot answer IdP LogoutRequest");
                LOGIN_PATH.to_string()
            });

        Ok(LogoutOutcome {
            redirect_url,
            clear_cookie: true,
        })
    }

    /// Strict mode turns a correlation or replay finding into an error;
    /// relaxed mode only logs it.
    fn enforce(&self, finding: ValidationError) -> AuthResult<()> {
        if self.provider.is_strict() {
            warn!(category = finding.category(), error = %finding, "Rejected SAML message");
            Err(finding.into())
        } else {
            warn!(category = finding.category(), error = %finding, "Accepted despite failed check (strict mode is off)");
            Ok(())
        }
    }

    fn revoke_quietly(&self, token: Option<SessionToken>) {
        if let Some(token) = token {
            if let Err(e) = self.sessions.revoke(token) {
                warn!(error = %e, "Failed to revoke session");
            }
        }
    }

    /// A post-login target that is safe to redirect to, or the home page.
    ///
    /// Accepts relative paths (not protocol-relative) and absolute URLs with
    /// the application's own origin, but never the login, logout or ACS
    /// endpoints.
    pub fn safe_redirect(&self, target: Option<&str>) -> String {
        let Some(target) = target.map(str::trim).filter(|t| !t.is_empty()) else {
            return HOME_PATH.to_string();
        };
        if target.chars().any(|c| c.is_control() || c == '\\') {
            return HOME_PATH.to_string();
        }

        let config = self.provider.config();
        let path = if target.starts_with('/') {
            if target.starts_with("//") {
                return HOME_PATH.to_string();
            }
            target.split(['?', '#']).next().unwrap_or(target).to_string()
        } else {
            match Url::parse(target) {
                Ok(url) if Some(url.origin()) == config.app_origin() => url.path().to_string(),
                _ => return HOME_PATH.to_string(),
            }
        };

        let forbidden = [LOGIN_PATH.to_string(), config.slo_path(), config.acs_path()];
        if forbidden.iter().any(|f| path.trim_end_matches('/') == f.trim_end_matches('/')) {
            return HOME_PATH.to_string();
        }
        target.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryStore, User};
    use crate::saml::authn::fixtures::ResponseFixture;
    use crate::saml::binding::{build_redirect_url, decode_and_inflate};
    use crate::saml::config::test_config;
    use crate::saml::dsig::testing::{idp_keys, rogue_keys};
    use crate::saml::protocol::{format_instant, ASSERTION_NS, PROTOCOL_NS};
    use crate::saml::{xml, MessageParam, RedirectQuery, SamlConfig};
    use openssl::pkey::{PKey, Private};
    use tempfile::TempDir;

    struct Harness {
        flow: AuthFlow,
        directory: Arc<DirectoryStore>,
        _dir: TempDir,
    }

    fn harness_with(config: SamlConfig, provisioner: Option<Arc<dyn UserProvisioner>>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::open(dir.path().join("sessions.redb"), 3600).unwrap());
        let directory = Arc::new(DirectoryStore::open(dir.path().join("directory.redb")).unwrap());
        let provisioner =
            provisioner.unwrap_or_else(|| directory.clone() as Arc<dyn UserProvisioner>);
        let flow = AuthFlow::new(SamlProvider::new(config).unwrap(), sessions, provisioner);
        Harness {
            flow,
            directory,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config(&idp_keys().cert_pem), None)
    }

    fn query_of(url: &str) -> RedirectQuery {
        RedirectQuery::parse(url.split_once('?').unwrap().1)
    }

    /// ID of the request carried by an outbound redirect.
    fn request_id_of(url: &str) -> String {
        let query = query_of(url);
        let doc = xml::parse(&decode_and_inflate(query.get("SAMLRequest").unwrap()).unwrap()).unwrap();
        doc.attr("ID").unwrap().to_string()
    }

    fn idp_redirect(config: &SamlConfig, param: MessageParam, xml: &str, key: &PKey<Private>) -> RedirectQuery {
        let url = build_redirect_url(&config.sp.slo_url, param, xml, None, Some(key)).unwrap();
        query_of(&url)
    }

    fn logout_response_xml(config: &SamlConfig, in_response_to: &str) -> String {
        format!(
            r#"<samlp:LogoutResponse xmlns:samlp="{}" xmlns:saml="{}" ID="_idp_lr" Version="2.0" IssueInstant="{}" Destination="{}" InResponseTo="{}"><saml:Issuer>{}</saml:Issuer><samlp:Status><samlp:StatusCode Value="{}"/></samlp:Status></samlp:LogoutResponse>"#,
            PROTOCOL_NS,
            ASSERTION_NS,
            format_instant(Utc::now()),
            config.sp.slo_url,
            in_response_to,
            config.idp.entity_id,
            STATUS_SUCCESS
        )
    }

    fn log_in(h: &Harness) -> LoginOutcome {
        let login_url = h.flow.login(Some("/dashboard")).unwrap();
        let request_id = request_id_of(&login_url);
        let fixture = ResponseFixture::new(h.flow.provider().config(), Utc::now()).in_response_to(&request_id);
        h.flow
            .assertion_consumer(&fixture.encoded(), query_of(&login_url).relay_state())
            .unwrap()
    }

    #[test]
    fn test_login_end_to_end() {
        let h = harness();
        let outcome = log_in(&h);

        assert_eq!(outcome.redirect_url, "/dashboard");
        let session = h.flow.sessions().lookup(outcome.session.token).unwrap().unwrap();
        assert_eq!(session.name_id(), "alice@example.com");

        let user = h.directory.get_user("alice@example.com").unwrap().unwrap();
        assert_eq!(user.display_name, "Alice Example");
    }

    #[test]
    fn test_unsolicited_response_rejected_in_strict_mode() {
        let h = harness();
        let fixture = ResponseFixture::new(h.flow.provider().config(), Utc::now());
        let err = h.flow.assertion_consumer(&fixture.encoded(), None).unwrap_err();
        assert_eq!(err.category(), "unsolicited_response");
        assert_eq!(h.flow.sessions().session_count().unwrap(), 0);

        let fixture = ResponseFixture::new(h.flow.provider().config(), Utc::now()).in_response_to("_never_sent");
        let err = h.flow.assertion_consumer(&fixture.encoded(), None).unwrap_err();
        assert_eq!(err.category(), "unsolicited_response");
    }

    #[test]
    fn test_unsolicited_response_accepted_in_relaxed_mode() {
        let mut config = test_config(&idp_keys().cert_pem);
        config.policy.strict = false;
        let h = harness_with(config, None);
        let fixture = ResponseFixture::new(h.flow.provider().config(), Utc::now());
        let outcome = h.flow.assertion_consumer(&fixture.encoded(), None).unwrap();
        assert_eq!(outcome.redirect_url, HOME_PATH);
    }

    #[test]
    fn test_replayed_assertion_rejected() {
        let h = harness();
        let login_url = h.flow.login(None).unwrap();
        let fixture = ResponseFixture::new(h.flow.provider().config(), Utc::now())
            .in_response_to(&request_id_of(&login_url));
        let encoded = fixture.encoded();

        h.flow.assertion_consumer(&encoded, None).unwrap();
        let err = h.flow.assertion_consumer(&encoded, None).unwrap_err();
        assert_eq!(err.category(), "replay_detected");
        assert_eq!(h.flow.sessions().session_count().unwrap(), 1);
    }

    #[test]
    fn test_invalid_signature_creates_no_session() {
        let h = harness();
        let login_url = h.flow.login(None).unwrap();
        let mut fixture = ResponseFixture::new(h.flow.provider().config(), Utc::now())
            .in_response_to(&request_id_of(&login_url));
        fixture.key = &rogue_keys().key;

        let err = h.flow.assertion_consumer(&fixture.encoded(), None).unwrap_err();
        assert!(matches!(err, AuthError::Validation(ValidationError::InvalidSignature(_))));
        assert_eq!(h.flow.sessions().session_count().unwrap(), 0);
        assert!(h.directory.get_user("alice@example.com").unwrap().is_none());
    }

    struct BrokenProvisioner;

    impl UserProvisioner for BrokenProvisioner {
        fn upsert(&self, _: &str, _: &str) -> anyhow::Result<User> {
            anyhow::bail!("directory unavailable")
        }
    }

    #[test]
    fn test_provisioner_failure_creates_no_session() {
        let h = harness_with(test_config(&idp_keys().cert_pem), Some(Arc::new(BrokenProvisioner)));
        let login_url = h.flow.login(None).unwrap();
        let fixture = ResponseFixture::new(h.flow.provider().config(), Utc::now())
            .in_response_to(&request_id_of(&login_url));

        let err = h.flow.assertion_consumer(&fixture.encoded(), None).unwrap_err();
        assert!(matches!(err, AuthError::Provisioning(_)));
        assert_eq!(h.flow.sessions().session_count().unwrap(), 0);
    }

    #[test]
    fn test_single_logout_round_trip() {
        let h = harness();
        let token = log_in(&h).session.token;

        let outcome = h.flow.logout(Some(token), LogoutDispatch::Initiate).unwrap();
        assert!(outcome.redirect_url.starts_with("https://idp.example.com/slo?SAMLRequest="));
        assert!(!outcome.clear_cookie);
        // Not cleared until the IdP confirms.
        assert!(h.flow.sessions().lookup(token).unwrap().is_some());

        let request_id = request_id_of(&outcome.redirect_url);
        let config = h.flow.provider().config().clone();
        let query = idp_redirect(
            &config,
            MessageParam::Response,
            &logout_response_xml(&config, &request_id),
            &idp_keys().key,
        );
        let outcome = h
            .flow
            .logout(Some(token), LogoutDispatch::Complete(InboundMessage::Redirect(&query)))
            .unwrap();
        assert_eq!(outcome, LogoutOutcome::to_login(true));
        assert!(h.flow.sessions().lookup(token).unwrap().is_none());
    }

    #[test]
    fn test_logout_completion_without_cookie_revokes_recorded_session() {
        let h = harness();
        let token = log_in(&h).session.token;
        let outcome = h.flow.logout(Some(token), LogoutDispatch::Initiate).unwrap();
        let request_id = request_id_of(&outcome.redirect_url);

        let config = h.flow.provider().config().clone();
        let query = idp_redirect(
            &config,
            MessageParam::Response,
            &logout_response_xml(&config, &request_id),
            &idp_keys().key,
        );
        h.flow
            .logout(None, LogoutDispatch::Complete(InboundMessage::Redirect(&query)))
            .unwrap();
        assert!(h.flow.sessions().lookup(token).unwrap().is_none());
    }

    #[test]
    fn test_forged_logout_response_keeps_session() {
        let h = harness();
        let token = log_in(&h).session.token;
        let outcome = h.flow.logout(Some(token), LogoutDispatch::Initiate).unwrap();
        let request_id = request_id_of(&outcome.redirect_url);

        let config = h.flow.provider().config().clone();
        let query = idp_redirect(
            &config,
            MessageParam::Response,
            &logout_response_xml(&config, &request_id),
            &rogue_keys().key,
        );
        let outcome = h
            .flow
            .logout(Some(token), LogoutDispatch::Complete(InboundMessage::Redirect(&query)))
            .unwrap();
        assert_eq!(outcome, LogoutOutcome::to_login(false));
        assert!(h.flow.sessions().lookup(token).unwrap().is_some());
    }

    #[test]
    fn test_uncorrelated_logout_response_keeps_session() {
        let h = harness();
        let token = log_in(&h).session.token;

        let config = h.flow.provider().config().clone();
        let query = idp_redirect(
            &config,
            MessageParam::Response,
            &logout_response_xml(&config, "_never_sent"),
            &idp_keys().key,
        );
        let outcome = h
            .flow
            .logout(Some(token), LogoutDispatch::Complete(InboundMessage::Redirect(&query)))
            .unwrap();
        assert!(!outcome.clear_cookie);
        assert!(h.flow.sessions().lookup(token).unwrap().is_some());
    }

    #[test]
    fn test_logout_without_idp_slo_is_local() {
        let mut config = test_config(&idp_keys().cert_pem);
        config.idp.slo_url = None;
        let h = harness_with(config, None);
        let token = log_in(&h).session.token;

        let outcome = h.flow.logout(Some(token), LogoutDispatch::Initiate).unwrap();
        assert_eq!(outcome, LogoutOutcome::to_login(true));
        assert!(h.flow.sessions().lookup(token).unwrap().is_none());
    }

    #[test]
    fn test_logout_without_session() {
        let h = harness();
        let outcome = h.flow.logout(None, LogoutDispatch::Initiate).unwrap();
        assert_eq!(outcome, LogoutOutcome::to_login(true));
    }

    #[test]
    fn test_idp_initiated_logout() {
        let h = harness();
        let token = log_in(&h).session.token;

        let config = h.flow.provider().config().clone();
        let xml = format!(
            r#"<samlp:LogoutRequest xmlns:samlp="{}" xmlns:saml="{}" ID="_idp_req" Version="2.0" IssueInstant="{}" Destination="{}"><saml:Issuer>{}</saml:Issuer><saml:NameID>alice@example.com</saml:NameID></samlp:LogoutRequest>"#,
            PROTOCOL_NS,
            ASSERTION_NS,
            format_instant(Utc::now()),
            config.sp.slo_url,
            config.idp.entity_id
        );
        let query = idp_redirect(&config, MessageParam::Request, &xml, &idp_keys().key);

        let outcome = h
            .flow
            .logout(
                None,
                LogoutDispatch::IdpInitiated {
                    message: InboundMessage::Redirect(&query),
                    relay_state: Some("idp-state"),
                },
            )
            .unwrap();
        assert!(outcome.clear_cookie);
        assert!(outcome.redirect_url.starts_with("https://idp.example.com/slo?SAMLResponse="));
        assert_eq!(query_of(&outcome.redirect_url).relay_state(), Some("idp-state"));
        assert!(h.flow.sessions().lookup(token).unwrap().is_none());
    }

    #[test]
    fn test_safe_redirect() {
        let h = harness();
        let flow = &h.flow;
        assert_eq!(flow.safe_redirect(None), "/");
        assert_eq!(flow.safe_redirect(Some("")), "/");
        assert_eq!(flow.safe_redirect(Some("/dashboard?x=1")), "/dashboard?x=1");
        assert_eq!(flow.safe_redirect(Some("//evil.example.com/")), "/");
        assert_eq!(flow.safe_redirect(Some("/\\evil.example.com")), "/");
        assert_eq!(flow.safe_redirect(Some("https://evil.example.com/x")), "/");
        assert_eq!(flow.safe_redirect(Some("javascript:alert(1)")), "/");
        assert_eq!(
            flow.safe_redirect(Some("https://app.example.com/team")),
            "https://app.example.com/team"
        );
        assert_eq!(flow.safe_redirect(Some("/login")), "/");
        assert_eq!(flow.safe_redirect(Some("/logout?x=1")), "/");
        assert_eq!(flow.safe_redirect(Some("https://app.example.com/saml/acs")), "/");
    }
}
