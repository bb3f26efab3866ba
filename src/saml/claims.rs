//! Verified identity claims extracted from a SAML assertion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Claim URIs for the given name, most specific first.
pub const GIVEN_NAME_CLAIMS: &[&str] = &[
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/givenname",
    "urn:oid:2.5.4.42",
    "givenName",
    "firstName",
];

/// Claim URIs for the surname, most specific first.
pub const SURNAME_CLAIMS: &[&str] = &[
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/surname",
    "urn:oid:2.5.4.4",
    "sn",
    "surname",
    "lastName",
];

pub const EMAIL_CLAIMS: &[&str] = &[
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress",
    "urn:oid:0.9.2342.19200300.100.1.3",
    "email",
    "mail",
];

/// Identity asserted by the IdP for one successful login.
///
/// Immutable once produced by response validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionClaims {
    /// Durable user key. Case-sensitive, exactly as the IdP sent it.
    pub name_id: String,

    pub name_id_format: Option<String>,

    /// IdP session identifier, needed for a later LogoutRequest.
    pub session_index: Option<String>,

    /// Claim URI → values, in document order.
    pub attributes: HashMap<String, Vec<String>>,

    pub issuer: String,

    pub assertion_id: String,

    pub in_response_to: Option<String>,

    /// Upper bound the IdP places on the local session.
    pub session_not_on_or_after: Option<DateTime<Utc>>,

    /// End of the assertion validity window, used to age out replay records.
    pub not_on_or_after: Option<DateTime<Utc>>,
}

impl AssertionClaims {
    /// First value of an attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(|s| s.as_str())
    }

    pub fn attribute_values(&self, name: &str) -> &[String] {
        self.attributes
            .get(name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn first_of(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .find_map(|name| self.attribute(name))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn given_name(&self) -> Option<&str> {
        self.first_of(GIVEN_NAME_CLAIMS)
    }

    pub fn surname(&self) -> Option<&str> {
        self.first_of(SURNAME_CLAIMS)
    }

    /// Email claim, falling back to the NameID.
    pub fn email(&self) -> &str {
        self.first_of(EMAIL_CLAIMS).unwrap_or(self.name_id.as_str())
    }

    /// "Given Surname", or the NameID local part when the IdP sent neither.
    pub fn display_name(&self) -> String {
        let full = [self.given_name(), self.surname()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");

        if full.is_empty() {
            self.name_id
                .split('@')
                .next()
                .unwrap_or(self.name_id.as_str())
                .to_string()
        } else {
            full
        }
    }
}
