//! Token operations for UI callers and scheduled jobs.
//!
//! Returns only the access token and its expiry; refresh tokens never leave
//! the server side.

use axum::{
    extract::{Path, State},
    response::Json,
    routing::post,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::AppError;
use crate::tokens::TokenManager;

/// Shared state for the token endpoints.
#[derive(Clone)]
pub struct TokenAppState {
    pub manager: Arc<TokenManager>,
}

/// Access-token response handed to callers.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenResponse {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Create the token operations router.
pub fn create_token_router(state: TokenAppState) -> Router {
    Router::new()
        .route("/api/accounts/:id/token", post(get_valid_token))
        .route("/api/accounts/:id/token/refresh", post(force_refresh))
        .with_state(Arc::new(state))
}

async fn get_valid_token(
    State(state): State<Arc<TokenAppState>>,
    Path(account_id): Path<String>,
) -> Result<Json<AccessTokenResponse>, AppError> {
    let tokens = state.manager.get_valid_access_token(&account_id).await?;
    Ok(Json(AccessTokenResponse {
        access_token: tokens.access_token,
        expires_at: tokens.expires_at,
    }))
}

async fn force_refresh(
    State(state): State<Arc<TokenAppState>>,
    Path(account_id): Path<String>,
) -> Result<Json<AccessTokenResponse>, AppError> {
    let tokens = state.manager.force_refresh(&account_id).await?;
    Ok(Json(AccessTokenResponse {
        access_token: tokens.access_token,
        expires_at: tokens.expires_at,
    }))
}
