//! OAuth flow endpoints.
//!
//! `GET /api/oauth/:provider/start` hands the UI the authorization URL to
//! send the user to; `GET /api/oauth/:provider/callback` is the redirect
//! target registered with the provider.

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::AppError;
use crate::credentials::Provider;
use crate::oauth::{BeginAuthorization, OAuthFlow};

/// Shared state for the OAuth endpoints.
#[derive(Clone)]
pub struct OAuthAppState {
    pub flow: OAuthFlow,
}

/// Query parameters for starting a flow.
#[derive(Deserialize)]
pub struct StartParams {
    user_id: String,
    org_id: String,
}

/// OAuth callback query parameters.
#[derive(Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Callback success response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    account_id: String,
}

/// Create the OAuth flow router.
pub fn create_oauth_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/api/oauth/:provider/start", get(oauth_start))
        .route("/api/oauth/:provider/callback", get(oauth_callback))
        .with_state(Arc::new(state))
}

async fn oauth_start(
    State(state): State<Arc<OAuthAppState>>,
    Path(provider): Path<String>,
    Query(params): Query<StartParams>,
) -> Result<Json<BeginAuthorization>, AppError> {
    let provider: Provider = provider
        .parse()
        .map_err(|_| AppError::NotFound(format!("provider '{}' not found", provider)))?;

    debug!(%provider, user_id = %params.user_id, "oauth start requested");

    let begun = state
        .flow
        .begin_authorization(&params.user_id, &params.org_id, provider)?;

    Ok(Json(begun))
}

async fn oauth_callback(
    State(state): State<Arc<OAuthAppState>>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<CallbackResponse>, AppError> {
    if let Some(error) = &params.error {
        warn!(
            provider,
            error,
            description = params.error_description.as_deref().unwrap_or(""),
            "oauth callback carried a provider error"
        );
    }

    let code = params.code.as_deref().unwrap_or_default();
    let callback_state = params
        .state
        .as_deref()
        .ok_or_else(|| AppError::BadRequest("missing state parameter".to_string()))?;

    let account = state
        .flow
        .complete_authorization(code, callback_state, params.error.as_deref())
        .await?;

    Ok(Json(CallbackResponse {
        account_id: account.id,
    }))
}
