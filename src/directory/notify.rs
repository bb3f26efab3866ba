//! Star notifications.

use anyhow::{Context, Result};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::sync::Arc;
use tracing::{info, warn};

use super::types::User;

pub const DEFAULT_SMTP_PORT: u16 = 587;
pub const DEFAULT_SENDER: &str = "noreply@goldstar.com";

const SUBJECT: &str = "You've Received a Gold Star! \u{2b50}";

/// Tells a user they received a star.
pub trait Notifier: Send + Sync {
    fn star_received(&self, receiver: &User, giver_name: &str) -> Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn star_received(&self, receiver: &User, giver_name: &str) -> Result<()> {
        info!(
            receiver = %receiver.email,
            giver = %giver_name,
            "You received a gold star from {}",
            giver_name
        );
        Ok(())
    }
}

/// Outbound mail server.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub sender: String,
}

/// Emails the receiver over SMTP with STARTTLS.
pub struct SmtpNotifier {
    transport: SmtpTransport,
    sender: Mailbox,
}

impl SmtpNotifier {
    pub fn new(settings: &SmtpSettings) -> Result<Self> {
        let sender = settings
            .sender
            .parse::<Mailbox>()
            .with_context(|| format!("Invalid sender address: {}", settings.sender))?;
        let transport = SmtpTransport::starttls_relay(&settings.server)
            .with_context(|| format!("Invalid SMTP server: {}", settings.server))?
            .port(settings.port)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .build();
        Ok(Self { transport, sender })
    }

    fn message(&self, receiver: &User, giver_name: &str) -> Result<Message> {
        let to = receiver
            .email
            .parse::<Mailbox>()
            .with_context(|| format!("Invalid receiver address: {}", receiver.email))?;
        let body = format!(
            "Congratulations!\n\nYou have received a gold star from {}.\n\nKeep up the great work!\n\nThe Gold Star Team",
            giver_name
        );
        Message::builder()
            .from(self.sender.clone())
            .to(to)
            .subject(SUBJECT)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .context("Failed to build notification email")
    }
}

impl Notifier for SmtpNotifier {
    fn star_received(&self, receiver: &User, giver_name: &str) -> Result<()> {
        let message = self.message(receiver, giver_name)?;
        self.transport
            .send(&message)
            .context("SMTP delivery failed")?;
        info!(receiver = %receiver.email, "Notification email sent");
        Ok(())
    }
}

/// SMTP when it is configured, the log otherwise.
pub fn build_notifier(smtp: Option<SmtpSettings>) -> Result<Arc<dyn Notifier>> {
    match smtp {
        Some(settings) => {
            let notifier = SmtpNotifier::new(&settings)?;
            info!(server = %settings.server, port = settings.port, "Star notifications go out by email");
            Ok(Arc::new(notifier))
        }
        None => {
            info!("SMTP not configured; star notifications are only logged");
            Ok(Arc::new(LogNotifier))
        }
    }
}

/// Notify without waiting. Failures are logged, never surfaced.
pub fn notify_in_background(notifier: Arc<dyn Notifier>, receiver: User, giver_name: String) {
    // SMTP delivery blocks.
    tokio::task::spawn_blocking(move || {
        if let Err(e) = notifier.star_received(&receiver, &giver_name) {
            warn!(receiver = %receiver.email, error = %e, "Star notification failed");
        }
    });
}
