//! Session types for SAML authentication persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::saml::AssertionClaims;

/// Opaque session token (32 random bytes, hex-encoded in cookies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken([u8; 32]);

impl SessionToken {
    /// Generate a new token from the thread-local CSPRNG (OS seeded).
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A logged-in browser, bound to the claims of the assertion that created it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: SessionToken,

    pub claims: AssertionClaims,

    pub created_at: DateTime<Utc>,

    /// The earlier of the local TTL and the IdP's SessionNotOnOrAfter.
    pub expires_at: DateTime<Utc>,

    /// Last access time (updated on each request).
    pub last_accessed: DateTime<Utc>,
}

impl Session {
    pub fn new(claims: AssertionClaims, ttl_secs: u64) -> Self {
        let now = Utc::now();
        let local_expiry = now + chrono::Duration::seconds(ttl_secs as i64);
        let expires_at = match claims.session_not_on_or_after {
            Some(idp_expiry) if idp_expiry < local_expiry => idp_expiry,
            _ => local_expiry,
        };

        Self {
            token: SessionToken::generate(),
            claims,
            created_at: now,
            expires_at,
            last_accessed: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }

    pub fn name_id(&self) -> &str {
        &self.claims.name_id
    }
}

#[cfg(test)]
pub(crate) fn test_claims(name_id: &str, assertion_id: &str) -> AssertionClaims {
    AssertionClaims {
        name_id: name_id.to_string(),
        name_id_format: None,
        session_index: Some("_session_1".to_string()),
        attributes: Default::default(),
        issuer: "https://idp.example.com/metadata".to_string(),
        assertion_id: assertion_id.to_string(),
        in_response_to: None,
        session_not_on_or_after: None,
        not_on_or_after: None,
    }
}
