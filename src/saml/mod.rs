//! SAML authentication module.
//!
//! SP side of Web Browser SSO and Single Logout: message construction,
//! XML signature verification and response validation.

pub mod authn;
pub mod binding;
pub mod claims;
pub mod config;
pub mod dsig;
pub mod error;
pub mod logout;
pub mod metadata;
pub mod protocol;
pub mod provider;
pub mod tracker;
pub mod xml;

pub use binding::{MessageParam, RedirectQuery};
pub use claims::AssertionClaims;
pub use config::{IdentityProviderConfig, SamlConfig, ServiceProviderConfig, ValidationPolicy};
pub use error::{AuthError, AuthResult, ValidationError};
pub use logout::InboundMessage;
pub use provider::SamlProvider;
pub use tracker::{PendingRequest, RequestTracker};
