//! Session management for SAML authentication.
//!
//! Sessions are persisted in redb with an in-memory cache, expire on a TTL
//! capped by the IdP, and are swept by a background task.

pub mod cleanup;
pub mod store;
pub mod types;

pub use cleanup::{spawn_cleanup_task, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use store::SessionStore;
pub use types::{Session, SessionToken};
