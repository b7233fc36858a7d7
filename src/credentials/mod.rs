//! Encrypted credential storage for marketplace OAuth tokens.
//!
//! This module owns every piece of secret material in the process:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       SecretStore                        │
//! │  - accounts / secrets / oauth_states     │
//! │  - generation fallback on read           │
//! │  - newest-generation writes only         │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Envelope Codec                     │
//! │  - AES-256-GCM, unique nonce per write   │
//! │  - reads every shape ever written        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! No other module reads the secret columns directly; the fallback and
//! non-downgrade invariants only hold behind this boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub mod encryption;
mod storage;

pub use storage::SecretStore;

/// A marketplace identity provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ebay,
    Etsy,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Ebay => "ebay",
            Provider::Etsy => "etsy",
        }
    }

    pub const ALL: [Provider; 2] = [Provider::Ebay, Provider::Etsy];
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ebay" => Ok(Provider::Ebay),
            "etsy" => Ok(Provider::Etsy),
            other => Err(Error::NotFound(format!("unknown provider '{}'", other))),
        }
    }
}

/// A full OAuth token set for one account.
///
/// Only ever materialized from decrypting a stored secret or from a provider
/// response. Never logged and never serialized outside the store boundary;
/// `Debug` redacts the token values.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub token_type: Option<String>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// One linked marketplace identity.
///
/// Created on successful OAuth completion, deactivated (never deleted) when
/// revoked. Many accounts may belong to one organization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntegrationAccount {
    pub id: String,
    pub provider: Provider,
    pub org_id: String,
    pub provider_account_id: String,
    pub display_name: String,
    pub active: bool,
    /// Non-secret profile metadata returned by the provider's identity
    /// endpoint (username, marketplace region, ...).
    pub profile: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A short-lived, single-use OAuth flow ticket.
///
/// Created at flow start, claimed exactly once at callback. Expired or used
/// states are inert.
#[derive(Clone, Debug)]
pub struct OAuthState {
    pub state: String,
    pub code_verifier: String,
    pub user_id: String,
    pub org_id: String,
    pub provider: Provider,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}
