//! Process configuration.
//!
//! Non-secret settings come from a TOML file with per-field defaults; secret
//! material (encryption key, provider client credentials) comes from the
//! environment only and never touches disk.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Complete marketlink configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarketlinkConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// SQLite database file for accounts and encrypted secrets.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_db_path() -> String {
    "marketlink.db".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
        }
    }
}

/// OAuth flow configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// Public base URL the provider redirects back to.
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    /// Lifetime of a state ticket (minutes).
    #[serde(default = "default_state_ttl_minutes")]
    pub state_ttl_minutes: i64,
    /// How often expired state tickets are purged (seconds).
    #[serde(default = "default_state_cleanup_interval")]
    pub state_cleanup_interval_seconds: u64,
}

fn default_callback_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_state_ttl_minutes() -> i64 {
    15
}

fn default_state_cleanup_interval() -> u64 {
    300
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            callback_base_url: default_callback_base_url(),
            state_ttl_minutes: default_state_ttl_minutes(),
            state_cleanup_interval_seconds: default_state_cleanup_interval(),
        }
    }
}

/// Token refresh configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Margin before expiry at which a token counts as stale (minutes).
    #[serde(default = "default_safety_margin_minutes")]
    pub safety_margin_minutes: i64,
    /// Look-ahead window of the proactive sweep (minutes).
    #[serde(default = "default_sweep_horizon_minutes")]
    pub sweep_horizon_minutes: i64,
    /// How often the proactive sweep runs (seconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_safety_margin_minutes() -> i64 {
    5
}

fn default_sweep_horizon_minutes() -> i64 {
    30
}

fn default_sweep_interval() -> u64 {
    600
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            safety_margin_minutes: default_safety_margin_minutes(),
            sweep_horizon_minutes: default_sweep_horizon_minutes(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &str) -> Result<MarketlinkConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Configuration(format!("failed to read {}: {}", path, e)))?;
    let config: MarketlinkConfig = toml::from_str(&contents)
        .map_err(|e| Error::Configuration(format!("failed to parse {}: {}", path, e)))?;
    Ok(config)
}

/// Reads the envelope encryption key material from the environment.
pub fn encryption_key_from_env() -> Result<String> {
    let key = std::env::var("MARKETLINK_ENCRYPTION_KEY").map_err(|_| {
        Error::Configuration("MARKETLINK_ENCRYPTION_KEY is not set".to_string())
    })?;
    crate::credentials::encryption::validate_key_material(&key)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MarketlinkConfig::default();
        assert_eq!(config.server.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.oauth.state_ttl_minutes, 15);
        assert_eq!(config.tokens.safety_margin_minutes, 5);
        assert_eq!(config.tokens.sweep_horizon_minutes, 30);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: MarketlinkConfig = toml::from_str(
            r#"
            [tokens]
            safety_margin_minutes = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.tokens.safety_margin_minutes, 10);
        assert_eq!(config.tokens.sweep_interval_seconds, 600);
        assert_eq!(config.server.db_path, "marketlink.db");
    }

    #[test]
    fn test_missing_config_file_is_configuration_error() {
        let err = load_config("/nonexistent/marketlink.toml").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
