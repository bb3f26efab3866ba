//! Directory records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A local user, provisioned from federated claims on every login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Primary key: the NameID exactly as the IdP sent it.
    pub email: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One gold star from one colleague to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Star {
    pub id: String,
    pub giver_email: String,
    pub receiver_email: String,
    pub created_at: DateTime<Utc>,
}

impl Star {
    pub fn new(giver_email: &str, receiver_email: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            giver_email: giver_email.to_string(),
            receiver_email: receiver_email.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Why a star could not be given.
#[derive(Debug, thiserror::Error)]
pub enum StarError {
    #[error("unknown receiver {0:?}")]
    UnknownReceiver(String),

    #[error("users cannot star themselves")]
    SelfStar,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
