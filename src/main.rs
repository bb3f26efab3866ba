//! Gold Star
//!
//! A small colleague-recognition app whose users sign in through a SAML 2.0
//! identity provider. This binary is the service provider: it starts SSO,
//! consumes assertions, manages sessions and takes part in Single Logout.

mod auth;
mod directory;
mod http;
mod saml;
mod session;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use auth::AuthFlow;
use directory::notify::{DEFAULT_SENDER, DEFAULT_SMTP_PORT};
use directory::{build_notifier, DirectoryStore, SmtpSettings};
use http::{AppState, CookieSettings};
use saml::config::NAMEID_FORMAT_UNSPECIFIED;
use saml::{IdentityProviderConfig, SamlConfig, SamlProvider, ServiceProviderConfig, ValidationPolicy};
use session::{spawn_cleanup_task, SessionStore, DEFAULT_CLEANUP_INTERVAL_SECS};

/// Default session lifetime: one working day.
const DEFAULT_SESSION_TTL_SECS: u64 = 8 * 60 * 60;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "gold-star")]
#[command(about = "Gold Star app with SAML 2.0 single sign-on")]
struct Args {
    /// SP entity ID
    #[arg(long, env = "SAML_SP_ENTITY_ID")]
    sp_entity_id: String,

    /// Assertion consumer service URL
    #[arg(long, env = "SAML_SP_ACS_URL")]
    sp_acs_url: String,

    /// SP single logout service URL
    #[arg(long, env = "SAML_SP_SLS_URL")]
    sp_sls_url: String,

    /// NameID format requested from the IdP
    #[arg(long, default_value = NAMEID_FORMAT_UNSPECIFIED, env = "SAML_NAME_ID_FORMAT")]
    name_id_format: String,

    /// Send a RequestedAuthnContext element
    #[arg(long, env = "SAML_REQUESTED_AUTHN_CONTEXT")]
    requested_authn_context: bool,

    /// SP private key (PEM) used to sign outbound messages
    #[arg(long, env = "SAML_SP_PRIVATE_KEY", hide_env_values = true, allow_hyphen_values = true)]
    sp_private_key: Option<String>,

    /// SP certificate (PEM) published in metadata
    #[arg(long, env = "SAML_SP_CERT", allow_hyphen_values = true)]
    sp_cert: Option<String>,

    /// IdP entity ID
    #[arg(long, env = "SAML_IDP_ENTITY_ID")]
    idp_entity_id: String,

    /// IdP single sign-on URL
    #[arg(long, env = "SAML_IDP_SSO_URL")]
    idp_sso_url: String,

    /// IdP single logout URL
    #[arg(long, env = "SAML_IDP_SLO_URL")]
    idp_slo_url: Option<String>,

    /// IdP signing certificate (PEM or bare base64)
    #[arg(long, env = "SAML_IDP_X509_CERT", allow_hyphen_values = true)]
    idp_cert: Option<String>,

    /// File holding the IdP signing certificate
    #[arg(long, env = "SAML_IDP_X509_CERT_FILE")]
    idp_cert_file: Option<PathBuf>,

    /// Strict validation (correlation, replay prevention, signed logout)
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "SAML_STRICT")]
    strict: bool,

    /// Clock skew tolerance in seconds
    #[arg(long, default_value_t = 180, env = "SAML_CLOCK_SKEW_SECS")]
    clock_skew_secs: i64,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:5000", env = "LISTEN_ADDR")]
    listen_addr: String,

    /// Directory for the embedded databases
    #[arg(long, default_value = "./data", env = "DATA_DIR")]
    data_dir: PathBuf,

    /// Session lifetime in seconds
    #[arg(long, default_value_t = DEFAULT_SESSION_TTL_SECS, env = "SESSION_TTL_SECS")]
    session_ttl_secs: u64,

    /// Expired session sweep interval in seconds
    #[arg(long, default_value_t = DEFAULT_CLEANUP_INTERVAL_SECS, env = "SESSION_CLEANUP_INTERVAL_SECS")]
    session_cleanup_interval_secs: u64,

    /// Set the Secure flag on the session cookie
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "COOKIE_SECURE")]
    cookie_secure: bool,

    /// SMTP server for star notification emails
    #[arg(long, env = "SMTP_SERVER")]
    smtp_server: Option<String>,

    /// SMTP port
    #[arg(long, default_value_t = DEFAULT_SMTP_PORT, env = "SMTP_PORT")]
    smtp_port: u16,

    /// SMTP user name
    #[arg(long, env = "SMTP_USER")]
    smtp_user: Option<String>,

    /// SMTP password
    #[arg(long, env = "SMTP_PASSWORD", hide_env_values = true)]
    smtp_password: Option<String>,

    /// Sender address of notification emails
    #[arg(long, default_value = DEFAULT_SENDER, env = "SMTP_SENDER_EMAIL")]
    smtp_sender_email: String,

    /// Enable verbose logging
    #[arg(short, long, env = "AUTH_VERBOSE")]
    verbose: bool,
}

impl Args {
    fn idp_certificate(&self) -> Result<String> {
        match (&self.idp_cert, &self.idp_cert_file) {
            (Some(pem), _) if !pem.trim().is_empty() => Ok(pem.clone()),
            (_, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read IdP certificate: {:?}", path)),
            _ => Err(anyhow!(
                "IdP certificate missing: set SAML_IDP_X509_CERT or SAML_IDP_X509_CERT_FILE"
            )),
        }
    }

    /// Mail settings, when server and credentials are all present.
    fn smtp_settings(&self) -> Option<SmtpSettings> {
        let present = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());
        let server = present(&self.smtp_server)?;
        let (Some(username), Some(password)) = (present(&self.smtp_user), present(&self.smtp_password))
        else {
            tracing::warn!("SMTP_SERVER set without SMTP_USER and SMTP_PASSWORD; emails disabled");
            return None;
        };
        Some(SmtpSettings {
            server,
            port: self.smtp_port,
            username,
            password,
            sender: self.smtp_sender_email.clone(),
        })
    }

    fn saml_config(&self) -> Result<SamlConfig> {
        let config = SamlConfig {
            sp: ServiceProviderConfig {
                entity_id: self.sp_entity_id.clone(),
                acs_url: self.sp_acs_url.clone(),
                slo_url: self.sp_sls_url.clone(),
                name_id_format: self.name_id_format.clone(),
                requested_authn_context: self.requested_authn_context,
                private_key_pem: self.sp_private_key.clone(),
                certificate_pem: self.sp_cert.clone(),
            },
            idp: IdentityProviderConfig {
                entity_id: self.idp_entity_id.clone(),
                sso_url: self.idp_sso_url.clone(),
                slo_url: self.idp_slo_url.clone().filter(|u| !u.trim().is_empty()),
                certificate_pem: self.idp_certificate()?,
            },
            policy: ValidationPolicy {
                strict: self.strict,
                clock_skew_secs: self.clock_skew_secs,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    info!("Starting Gold Star");

    let config = args.saml_config()?;
    info!(
        sp_entity_id = %config.sp.entity_id,
        idp_entity_id = %config.idp.entity_id,
        slo_enabled = config.slo_enabled(),
        strict = config.policy.strict,
        "Configuration loaded"
    );
    if !config.policy.strict {
        tracing::warn!("Strict validation is disabled; unsolicited and replayed responses are only logged");
    }

    let provider = SamlProvider::new(config)?;

    let session_store = Arc::new(
        SessionStore::open(args.data_dir.join("sessions.redb"), args.session_ttl_secs)
            .context("Failed to open session store")?,
    );
    let directory = Arc::new(
        DirectoryStore::open(args.data_dir.join("directory.redb"))
            .context("Failed to open directory store")?,
    );
    info!(path = ?args.data_dir, "Stores initialized");

    let _cleanup_handle = spawn_cleanup_task(
        Arc::clone(&session_store),
        args.session_cleanup_interval_secs,
    );

    let flow = AuthFlow::new(provider, session_store, directory.clone());
    let state = AppState {
        flow: Arc::new(flow),
        directory,
        notifier: build_notifier(args.smtp_settings())?,
        cookies: CookieSettings::new(args.cookie_secure, args.session_ttl_secs),
    };

    let listener = tokio::net::TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen_addr))?;
    info!(addr = %args.listen_addr, "Listening");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Server error")?;

    Ok(())
}
