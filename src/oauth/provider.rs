//! OAuth provider configurations.
//!
//! Endpoint URLs default to the real marketplace endpoints and are
//! overridable through configuration so tests can point them at a local
//! mock server. Client credentials come from environment variables only.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::credentials::Provider;
use crate::error::{Error, Result};

/// OAuth configuration for one provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Authorization endpoint URL.
    pub auth_url: String,

    /// Token endpoint URL (authorization_code and refresh_token grants).
    pub token_url: String,

    /// Identity endpoint URL, queried with a fresh access token.
    pub identity_url: String,

    /// Required OAuth scopes.
    pub scopes: Vec<String>,

    /// Client ID (from environment variable).
    pub client_id: String,

    /// Client secret (from environment variable).
    pub client_secret: String,

    /// Redirect URI registered with the provider.
    pub redirect_uri: String,
}

impl ProviderConfig {
    /// Builds the authorization URL carrying the PKCE challenge.
    pub fn build_auth_url(&self, state: &str, code_challenge: &str) -> String {
        let scopes = self.scopes.join(" ");
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}\
             &code_challenge={}&code_challenge_method=S256",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state),
            urlencoding::encode(code_challenge),
        )
    }
}

/// Default (auth_url, token_url, identity_url, scopes) per provider.
fn default_endpoints(provider: Provider) -> (&'static str, &'static str, &'static str, Vec<&'static str>) {
    match provider {
        Provider::Ebay => (
            "https://auth.ebay.com/oauth2/authorize",
            "https://api.ebay.com/identity/v1/oauth2/token",
            "https://apiz.ebay.com/commerce/identity/v1/user/",
            vec![
                "https://api.ebay.com/oauth/api_scope/sell.fulfillment",
                "https://api.ebay.com/oauth/api_scope/commerce.identity.readonly",
            ],
        ),
        Provider::Etsy => (
            "https://www.etsy.com/oauth/connect",
            "https://api.etsy.com/v3/public/oauth/token",
            "https://openapi.etsy.com/v3/application/users/me",
            vec!["transactions_r", "email_r"],
        ),
    }
}

/// Resolved provider configurations for the process.
#[derive(Clone, Debug, Default)]
pub struct ProviderRegistry {
    configs: HashMap<Provider, ProviderConfig>,
}

impl ProviderRegistry {
    /// Loads every provider whose client credentials are present in the
    /// environment (`MARKETLINK_OAUTH_<PROVIDER>_CLIENT_ID` / `_CLIENT_SECRET`).
    pub fn from_env(callback_base_url: &str) -> Self {
        let mut configs = HashMap::new();
        for provider in Provider::ALL {
            let prefix = provider.as_str().to_uppercase();
            let client_id = std::env::var(format!("MARKETLINK_OAUTH_{}_CLIENT_ID", prefix));
            let client_secret = std::env::var(format!("MARKETLINK_OAUTH_{}_CLIENT_SECRET", prefix));
            if let (Ok(client_id), Ok(client_secret)) = (client_id, client_secret) {
                let (auth_url, token_url, identity_url, scopes) = default_endpoints(provider);
                configs.insert(
                    provider,
                    ProviderConfig {
                        auth_url: auth_url.to_string(),
                        token_url: token_url.to_string(),
                        identity_url: identity_url.to_string(),
                        scopes: scopes.into_iter().map(|s| s.to_string()).collect(),
                        client_id,
                        client_secret,
                        redirect_uri: format!(
                            "{}/api/oauth/{}/callback",
                            callback_base_url.trim_end_matches('/'),
                            provider
                        ),
                    },
                );
            }
        }
        Self { configs }
    }

    /// Registers or replaces a provider configuration (tests point endpoint
    /// URLs at a mock server through this).
    pub fn insert(&mut self, provider: Provider, config: ProviderConfig) {
        self.configs.insert(provider, config);
    }

    /// Looks up a provider's configuration; absence is a configuration
    /// error, fatal for the operation that needed it.
    pub fn get(&self, provider: Provider) -> Result<&ProviderConfig> {
        self.configs.get(&provider).ok_or_else(|| {
            Error::Configuration(format!(
                "no client credentials configured for provider '{}'",
                provider
            ))
        })
    }

    pub fn configured(&self) -> impl Iterator<Item = Provider> + '_ {
        self.configs.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProviderConfig {
        ProviderConfig {
            auth_url: "https://example.com/oauth/authorize".to_string(),
            token_url: "https://example.com/oauth/token".to_string(),
            identity_url: "https://example.com/users/me".to_string(),
            scopes: vec!["read".to_string(), "write".to_string()],
            client_id: "test_client_id".to_string(),
            client_secret: "test_secret".to_string(),
            redirect_uri: "http://localhost:8080/api/oauth/ebay/callback".to_string(),
        }
    }

    #[test]
    fn test_build_auth_url_carries_pkce() {
        let url = test_config().build_auth_url("random_state", "challenge_abc");

        assert!(url.starts_with("https://example.com/oauth/authorize?response_type=code"));
        assert!(url.contains("client_id=test_client_id"));
        assert!(url.contains(
            "redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Fapi%2Foauth%2Febay%2Fcallback"
        ));
        assert!(url.contains("scope=read%20write"));
        assert!(url.contains("state=random_state"));
        assert!(url.contains("code_challenge=challenge_abc"));
        assert!(url.contains("code_challenge_method=S256"));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProviderRegistry::default();
        assert!(matches!(
            registry.get(Provider::Ebay),
            Err(Error::Configuration(_))
        ));

        registry.insert(Provider::Ebay, test_config());
        assert!(registry.get(Provider::Ebay).is_ok());
        assert_eq!(registry.configured().count(), 1);
    }
}
