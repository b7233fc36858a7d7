//! Error types for the credential and OAuth subsystem.
//!
//! Callers match on these variants to decide between "make the user
//! re-authenticate" and "retry later": [`Error::requires_reauth`] and
//! [`Error::is_transient`] encode that split.

use thiserror::Error;

/// Which outbound provider call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStage {
    /// Authorization-code exchange at the token endpoint.
    TokenExchange,
    /// Refresh-token grant at the token endpoint.
    Refresh,
    /// Identity lookup with a fresh access token.
    Identity,
    /// A downstream marketplace API call made on behalf of a caller.
    Api,
}

impl std::fmt::Display for ProviderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderStage::TokenExchange => "token_exchange",
            ProviderStage::Refresh => "refresh",
            ProviderStage::Identity => "identity",
            ProviderStage::Api => "api",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed encryption key material or provider client
    /// credentials. Fatal at startup/first use, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// OAuth state absent, already used, or expired. The remedy is to
    /// restart the login flow.
    #[error("invalid oauth state: {0}")]
    InvalidState(String),

    /// No envelope shape matched, or the AEAD tag failed verification.
    /// The stored credential is invalid and the account must re-link;
    /// this is never treated as "no token present".
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The user or the provider denied the authorization request.
    #[error("provider denied authorization: {0}")]
    ProviderDenied(String),

    /// A provider call failed. `status` is `None` for network-level
    /// failures (treated as transient).
    #[error("provider error during {stage} (status {status:?}): {message}")]
    Provider {
        stage: ProviderStage,
        status: Option<u16>,
        message: String,
    },

    /// No record for the requested account or secret.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Provider rejected the grant itself (4xx): the refresh token or code
    /// is dead and the account needs re-authentication.
    pub fn requires_reauth(&self) -> bool {
        match self {
            Error::Decryption(_) => true,
            Error::Provider {
                status: Some(code), ..
            } => (400..500).contains(code),
            _ => false,
        }
    }

    /// Transient provider-side or network failure, eligible for bounded
    /// retry with backoff at the caller's discretion.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Provider { status: None, .. } => true,
            Error::Provider {
                status: Some(code), ..
            } => *code >= 500,
            _ => false,
        }
    }

    /// True for a 401 from a downstream provider API call, the trigger for
    /// the refresh-once-retry-once reactive path.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Error::Provider {
                status: Some(401),
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reauth_classification() {
        let revoked = Error::Provider {
            stage: ProviderStage::Refresh,
            status: Some(400),
            message: "invalid_grant".to_string(),
        };
        assert!(revoked.requires_reauth());
        assert!(!revoked.is_transient());

        let outage = Error::Provider {
            stage: ProviderStage::Refresh,
            status: Some(503),
            message: "service unavailable".to_string(),
        };
        assert!(!outage.requires_reauth());
        assert!(outage.is_transient());

        let network = Error::Provider {
            stage: ProviderStage::TokenExchange,
            status: None,
            message: "connection refused".to_string(),
        };
        assert!(network.is_transient());
    }

    #[test]
    fn test_decryption_forces_reauth() {
        let err = Error::Decryption("no shape matched".to_string());
        assert!(err.requires_reauth());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_unauthorized_detection() {
        let unauthorized = Error::Provider {
            stage: ProviderStage::Api,
            status: Some(401),
            message: "token expired".to_string(),
        };
        assert!(unauthorized.is_unauthorized());

        let forbidden = Error::Provider {
            stage: ProviderStage::Api,
            status: Some(403),
            message: "scope missing".to_string(),
        };
        assert!(!forbidden.is_unauthorized());
    }
}
