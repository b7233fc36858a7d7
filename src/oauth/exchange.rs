//! Outbound provider calls: token exchange, token refresh, identity lookup.

use chrono::{Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use super::provider::ProviderConfig;
use crate::credentials::TokenSet;
use crate::error::{Error, ProviderStage, Result};

/// OAuth token response (standard OAuth 2.0).
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
}

impl TokenResponse {
    fn into_token_set(self) -> TokenSet {
        let expires_at = self
            .expires_in
            .map(|seconds| Utc::now() + Duration::seconds(seconds));
        TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            token_type: self.token_type,
        }
    }
}

/// Identity the provider reports for a fresh access token.
#[derive(Debug, Clone)]
pub struct ProviderIdentity {
    pub id: String,
    pub display_name: String,
    /// Raw (non-secret) response body, stored as account profile metadata.
    pub profile: serde_json::Value,
}

fn network_err(stage: ProviderStage, e: reqwest::Error) -> Error {
    Error::Provider {
        stage,
        status: None,
        message: e.to_string(),
    }
}

async fn post_token_request(
    client: &reqwest::Client,
    cfg: &ProviderConfig,
    stage: ProviderStage,
    form: &HashMap<&str, &str>,
) -> Result<TokenSet> {
    debug!(token_url = %cfg.token_url, %stage, "calling provider token endpoint");

    let response = client
        .post(&cfg.token_url)
        .header("Accept", "application/json")
        .basic_auth(&cfg.client_id, Some(&cfg.client_secret))
        .form(form)
        .send()
        .await
        .map_err(|e| network_err(stage, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(Error::Provider {
            stage,
            status: Some(status.as_u16()),
            message: body,
        });
    }

    let token_response: TokenResponse = response.json().await.map_err(|e| network_err(stage, e))?;

    debug!(
        %stage,
        has_refresh_token = token_response.refresh_token.is_some(),
        expires_in = ?token_response.expires_in,
        "provider token call succeeded"
    );

    Ok(token_response.into_token_set())
}

/// Exchanges an authorization code (plus its PKCE verifier) for a token set.
pub async fn exchange_code(
    client: &reqwest::Client,
    cfg: &ProviderConfig,
    code: &str,
    code_verifier: &str,
) -> Result<TokenSet> {
    let mut form = HashMap::new();
    form.insert("grant_type", "authorization_code");
    form.insert("code", code);
    form.insert("redirect_uri", cfg.redirect_uri.as_str());
    form.insert("client_id", cfg.client_id.as_str());
    form.insert("code_verifier", code_verifier);

    post_token_request(client, cfg, ProviderStage::TokenExchange, &form).await
}

/// Redeems a refresh token for a new token set.
pub async fn refresh_token(
    client: &reqwest::Client,
    cfg: &ProviderConfig,
    refresh_token: &str,
) -> Result<TokenSet> {
    let mut form = HashMap::new();
    form.insert("grant_type", "refresh_token");
    form.insert("refresh_token", refresh_token);
    form.insert("client_id", cfg.client_id.as_str());

    post_token_request(client, cfg, ProviderStage::Refresh, &form).await
}

/// Fetches the provider-side identity for the just-exchanged access token.
///
/// Providers disagree on field names; the normalizer takes the first of
/// `user_id` / `id` / `sub` as the stable identifier and keeps the whole
/// body as profile metadata.
pub async fn fetch_identity(
    client: &reqwest::Client,
    cfg: &ProviderConfig,
    access_token: &str,
) -> Result<ProviderIdentity> {
    let response = client
        .get(&cfg.identity_url)
        .bearer_auth(access_token)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| network_err(ProviderStage::Identity, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(Error::Provider {
            stage: ProviderStage::Identity,
            status: Some(status.as_u16()),
            message: body,
        });
    }

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| network_err(ProviderStage::Identity, e))?;

    let id = ["user_id", "id", "sub"]
        .iter()
        .find_map(|key| match body.get(*key) {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| Error::Provider {
            stage: ProviderStage::Identity,
            status: Some(status.as_u16()),
            message: "identity response carries no user identifier".to_string(),
        })?;

    let display_name = ["username", "login", "name"]
        .iter()
        .find_map(|key| body.get(*key).and_then(|v| v.as_str()))
        .unwrap_or(&id)
        .to_string();

    Ok(ProviderIdentity {
        id,
        display_name,
        profile: body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Provider;
    use mockito::Server;

    fn config_for(server: &Server) -> ProviderConfig {
        ProviderConfig {
            auth_url: format!("{}/authorize", server.url()),
            token_url: format!("{}/token", server.url()),
            identity_url: format!("{}/users/me", server.url()),
            scopes: vec!["sell".to_string()],
            client_id: "client-1".to_string(),
            client_secret: "secret-1".to_string(),
            redirect_uri: format!("http://localhost/api/oauth/{}/callback", Provider::Ebay),
        }
    }

    #[tokio::test]
    async fn test_exchange_code_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                mockito::Matcher::UrlEncoded("code".into(), "auth-code-1".into()),
                mockito::Matcher::UrlEncoded("code_verifier".into(), "verifier-1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "access_token": "acc-1",
                    "refresh_token": "ref-1",
                    "expires_in": 3600,
                    "token_type": "Bearer"
                }"#,
            )
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let tokens = exchange_code(&client, &config_for(&server), "auth-code-1", "verifier-1")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(tokens.access_token, "acc-1");
        assert_eq!(tokens.refresh_token.as_deref(), Some("ref-1"));
        assert!(tokens.expires_at.unwrap() > Utc::now() + Duration::minutes(55));
    }

    #[tokio::test]
    async fn test_exchange_code_4xx_is_grant_failure() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let err = exchange_code(&client, &config_for(&server), "bad", "v")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Provider {
                stage: ProviderStage::TokenExchange,
                status: Some(400),
                ..
            }
        ));
        assert!(err.requires_reauth());
    }

    #[tokio::test]
    async fn test_refresh_5xx_is_transient() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(503)
            .with_body("upstream down")
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let err = refresh_token(&client, &config_for(&server), "ref-1")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Provider {
                stage: ProviderStage::Refresh,
                status: Some(503),
                ..
            }
        ));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_fetch_identity_normalizes_fields() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/users/me")
            .match_header("authorization", "Bearer acc-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"user_id": "u-42", "username": "shopkeeper", "region": "DE"}"#)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let identity = fetch_identity(&client, &config_for(&server), "acc-1")
            .await
            .unwrap();

        assert_eq!(identity.id, "u-42");
        assert_eq!(identity.display_name, "shopkeeper");
        assert_eq!(identity.profile["region"], "DE");
    }

    #[tokio::test]
    async fn test_fetch_identity_numeric_id() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/users/me")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": 9981}"#)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let identity = fetch_identity(&client, &config_for(&server), "acc-1")
            .await
            .unwrap();

        assert_eq!(identity.id, "9981");
        assert_eq!(identity.display_name, "9981");
    }

    #[test]
    fn test_token_response_minimal() {
        let json = r#"{"access_token": "token_12345"}"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        let tokens = response.into_token_set();
        assert_eq!(tokens.access_token, "token_12345");
        assert_eq!(tokens.refresh_token, None);
        assert_eq!(tokens.expires_at, None);
    }
}
