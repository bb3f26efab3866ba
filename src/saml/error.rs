//! Error taxonomy for the SAML lifecycle.

use thiserror::Error;

/// A SAML message failed validation.
///
/// Every variant is terminal for the login or logout attempt that produced it.
/// The detail string is for logs; callers only ever see [`category`](Self::category).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("assertion expired: {0}")]
    ExpiredAssertion(String),

    #[error("assertion not yet valid: {0}")]
    NotYetValid(String),

    #[error("audience mismatch: {0}")]
    AudienceMismatch(String),

    #[error("destination mismatch: {0}")]
    DestinationMismatch(String),

    #[error("issuer mismatch: {0}")]
    IssuerMismatch(String),

    #[error("malformed message: {0}")]
    MalformedResponse(String),

    #[error("IdP returned non-success status: {0}")]
    StatusFailure(String),

    #[error("unsolicited message: {0}")]
    UnsolicitedResponse(String),

    #[error("assertion replay detected: {0}")]
    ReplayDetected(String),
}

impl ValidationError {
    /// Stable, detail-free category used in HTTP responses.
    pub fn category(&self) -> &'static str {
        match self {
            ValidationError::InvalidSignature(_) => "invalid_signature",
            ValidationError::ExpiredAssertion(_) => "expired_assertion",
            ValidationError::NotYetValid(_) => "assertion_not_yet_valid",
            ValidationError::AudienceMismatch(_) => "audience_mismatch",
            ValidationError::DestinationMismatch(_) => "destination_mismatch",
            ValidationError::IssuerMismatch(_) => "issuer_mismatch",
            ValidationError::MalformedResponse(_) => "malformed_response",
            ValidationError::StatusFailure(_) => "status_failure",
            ValidationError::UnsolicitedResponse(_) => "unsolicited_response",
            ValidationError::ReplayDetected(_) => "replay_detected",
        }
    }
}

pub(crate) fn malformed(detail: impl std::fmt::Display) -> ValidationError {
    ValidationError::MalformedResponse(detail.to_string())
}

pub(crate) fn bad_signature(detail: impl std::fmt::Display) -> ValidationError {
    ValidationError::InvalidSignature(detail.to_string())
}

/// Top-level error for the authentication flow.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Missing or unusable configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The assertion was valid but the local user could not be provisioned.
    #[error("user provisioning failed: {0:#}")]
    Provisioning(anyhow::Error),

    #[error("session storage failed: {0:#}")]
    Storage(anyhow::Error),
}

impl AuthError {
    pub fn category(&self) -> &'static str {
        match self {
            AuthError::Configuration(_) => "configuration_error",
            AuthError::Validation(e) => e.category(),
            AuthError::Provisioning(_) => "provisioning_failed",
            AuthError::Storage(_) => "storage_failed",
        }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
