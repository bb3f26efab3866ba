//! HTTP surface.

pub mod cookies;
mod error;
pub mod routes;

use std::sync::Arc;

use crate::auth::AuthFlow;
use crate::directory::{DirectoryStore, Notifier};

pub use cookies::CookieSettings;
pub use routes::router;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub flow: Arc<AuthFlow>,
    pub directory: Arc<DirectoryStore>,
    pub notifier: Arc<dyn Notifier>,
    pub cookies: CookieSettings,
}
