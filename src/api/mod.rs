//! HTTP API surface: the OAuth flow endpoints and the token operations
//! consumed by the UI layer and scheduled jobs.

pub mod oauth;
pub mod tokens;

pub use oauth::{create_oauth_router, OAuthAppState};
pub use tokens::{create_token_router, TokenAppState};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

use crate::error::Error;

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error type for API endpoints.
pub(crate) enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    ServerError(String),
    BadGateway(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match &err {
            Error::InvalidState(_) | Error::ProviderDenied(_) => {
                AppError::BadRequest(err.to_string())
            }
            Error::NotFound(_) => AppError::NotFound(err.to_string()),
            // An unreadable credential means the link is dead; the caller
            // must send the user back through authorization.
            Error::Decryption(_) => AppError::Unauthorized(
                "stored credential is invalid; re-authentication required".to_string(),
            ),
            Error::Provider { .. } if err.requires_reauth() => AppError::Unauthorized(
                "provider rejected the stored grant; re-authentication required".to_string(),
            ),
            Error::Provider { .. } => AppError::BadGateway(err.to_string()),
            Error::Configuration(_) | Error::Storage(_) | Error::Serialization(_) => {
                AppError::ServerError(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderStage;

    fn status_of(err: Error) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_of(Error::InvalidState("used".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(Error::NotFound("account".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(Error::Decryption("tag mismatch".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(Error::Provider {
                stage: ProviderStage::Refresh,
                status: Some(400),
                message: "invalid_grant".into(),
            }),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(Error::Provider {
                stage: ProviderStage::Refresh,
                status: Some(503),
                message: "down".into(),
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(Error::Configuration("no key".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
