// End-to-end account linking: begin authorization, simulated provider
// callback, token retrieval, and replay rejection.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use std::sync::Arc;
use tower::ServiceExt;

use marketlink::api::{
    create_oauth_router, create_token_router, OAuthAppState, TokenAppState,
};
use marketlink::credentials::{Provider, SecretStore};
use marketlink::oauth::{OAuthFlow, ProviderConfig, ProviderRegistry};
use marketlink::tokens::TokenManager;

struct TestApp {
    app: Router,
    store: Arc<SecretStore>,
}

fn create_test_app(server: &mockito::Server) -> TestApp {
    let store = Arc::new(SecretStore::new(":memory:", "integration-test-key").unwrap());

    let mut registry = ProviderRegistry::default();
    registry.insert(
        Provider::Ebay,
        ProviderConfig {
            auth_url: format!("{}/authorize", server.url()),
            token_url: format!("{}/token", server.url()),
            identity_url: format!("{}/users/me", server.url()),
            scopes: vec!["sell".to_string()],
            client_id: "client-1".to_string(),
            client_secret: "secret-1".to_string(),
            redirect_uri: "http://localhost:8080/api/oauth/ebay/callback".to_string(),
        },
    );
    let registry = Arc::new(registry);

    let flow = OAuthFlow::new(Arc::clone(&store), Arc::clone(&registry));
    let manager = Arc::new(TokenManager::new(Arc::clone(&store), registry));

    let app = create_oauth_router(OAuthAppState { flow })
        .merge(create_token_router(TokenAppState { manager }));

    TestApp { app, store }
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn post_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_new_link_end_to_end_and_replay_rejected() {
    let mut server = mockito::Server::new_async().await;
    let exchange_mock = server
        .mock("POST", "/token")
        .match_body(mockito::Matcher::AllOf(vec![
            mockito::Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            mockito::Matcher::UrlEncoded("code".into(), "provider-code-1".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "access_token": "exchanged-access",
                "refresh_token": "exchanged-refresh",
                "expires_in": 3600,
                "token_type": "Bearer"
            }"#,
        )
        .expect(1)
        .create_async()
        .await;
    let identity_mock = server
        .mock("GET", "/users/me")
        .match_header("authorization", "Bearer exchanged-access")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"user_id": "seller-42", "username": "shopkeeper"}"#)
        .expect(1)
        .create_async()
        .await;

    let test_app = create_test_app(&server);

    // Begin: the authorization URL carries the PKCE challenge.
    let (status, begun) = get_json(
        &test_app.app,
        "/api/oauth/ebay/start?user_id=user-1&org_id=org-1",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let auth_url = begun["authorizationUrl"].as_str().unwrap();
    assert!(auth_url.contains("code_challenge="));
    assert!(auth_url.contains("code_challenge_method=S256"));
    let state = begun["state"].as_str().unwrap().to_string();

    // Simulated provider callback.
    let callback_uri = format!(
        "/api/oauth/ebay/callback?code=provider-code-1&state={}",
        state
    );
    let (status, linked) = get_json(&test_app.app, &callback_uri).await;
    assert_eq!(status, StatusCode::OK);
    let account_id = linked["accountId"].as_str().unwrap().to_string();

    exchange_mock.assert_async().await;
    identity_mock.assert_async().await;

    // The linked account hands out the exchanged token.
    let (status, token) = post_json(
        &test_app.app,
        &format!("/api/accounts/{}/token", account_id),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(token["accessToken"], "exchanged-access");
    assert!(token["expiresAt"].is_string());
    assert!(token.get("refreshToken").is_none());

    // Replaying the used state fails without side effects.
    let (status, body) = get_json(&test_app.app, &callback_uri).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("state"));

    let accounts = test_app.store.list_active_accounts(Provider::Ebay).unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].provider_account_id, "seller-42");
    assert_eq!(accounts[0].display_name, "shopkeeper");
}

#[tokio::test]
async fn test_provider_denial_rejected_at_callback() {
    let server = mockito::Server::new_async().await;
    let test_app = create_test_app(&server);

    let (status, begun) = get_json(
        &test_app.app,
        "/api/oauth/ebay/start?user_id=user-1&org_id=org-1",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let state = begun["state"].as_str().unwrap();

    let (status, _) = get_json(
        &test_app.app,
        &format!(
            "/api/oauth/ebay/callback?error=access_denied&error_description=User+cancelled&state={}",
            state
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(test_app
        .store
        .list_active_accounts(Provider::Ebay)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_unknown_provider_is_404() {
    let server = mockito::Server::new_async().await;
    let test_app = create_test_app(&server);

    let (status, _) = get_json(
        &test_app.app,
        "/api/oauth/amazon/start?user_id=user-1&org_id=org-1",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_forged_state_rejected() {
    let server = mockito::Server::new_async().await;
    let test_app = create_test_app(&server);

    let (status, _) = get_json(
        &test_app.app,
        "/api/oauth/ebay/callback?code=c&state=forged",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_force_refresh_endpoint() {
    let mut server = mockito::Server::new_async().await;
    let refresh_mock = server
        .mock("POST", "/token")
        .match_body(mockito::Matcher::UrlEncoded(
            "grant_type".into(),
            "refresh_token".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "forced-access", "expires_in": 3600}"#)
        .expect(1)
        .create_async()
        .await;

    let test_app = create_test_app(&server);
    let account = test_app
        .store
        .upsert_account(
            Provider::Ebay,
            "seller-1",
            "org-1",
            "Seller",
            &serde_json::json!({}),
        )
        .unwrap();
    test_app
        .store
        .put_tokens(
            &account.id,
            Provider::Ebay,
            &marketlink::credentials::TokenSet {
                access_token: "old-access".to_string(),
                refresh_token: Some("old-refresh".to_string()),
                expires_at: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
                token_type: None,
            },
        )
        .unwrap();

    let (status, body) = post_json(
        &test_app.app,
        &format!("/api/accounts/{}/token/refresh", account.id),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accessToken"], "forced-access");
    refresh_mock.assert_async().await;
}

#[tokio::test]
async fn test_token_for_unknown_account_is_404() {
    let server = mockito::Server::new_async().await;
    let test_app = create_test_app(&server);

    let (status, _) = post_json(&test_app.app, "/api/accounts/no-such/token").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
