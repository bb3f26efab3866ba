//! Local users and the stars they give each other.

pub mod notify;
pub mod store;
pub mod types;

pub use notify::{build_notifier, notify_in_background, Notifier, SmtpSettings};
pub use store::DirectoryStore;
pub use types::{StarError, User};

/// Creates or refreshes the local user for a federated identity.
///
/// Must be idempotent: it runs on every successful login.
pub trait UserProvisioner: Send + Sync {
    fn upsert(&self, email: &str, display_name: &str) -> anyhow::Result<User>;
}
