use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_shared::error::AuthError;
use courier_shared::protocol::{ErrorCode, ErrorPayload};
use courier_store::StoreError;

/// Errors surfaced on the HTTP side (handshake, health).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Authentication failed: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Errors raised while handling a socket event. Each maps to a wire
/// [`ErrorCode`] and is reported to the originating connection only.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),

    #[error("{0}")]
    Validation(String),

    #[error("Not a member of this conversation")]
    NotMember,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Store failure: {0}")]
    StoreFailure(#[from] StoreError),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Authentication(_) => ErrorCode::Unauthenticated,
            GatewayError::Validation(_) => ErrorCode::Validation,
            GatewayError::NotMember => ErrorCode::NotMember,
            GatewayError::RateLimited => ErrorCode::RateLimited,
            GatewayError::StoreFailure(_) => ErrorCode::StoreFailure,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            GatewayError::StoreFailure(e) => ErrorPayload {
                error: "Store failure".to_string(),
                code: self.code(),
                details: Some(e.to_string()),
            },
            _ => ErrorPayload {
                error: self.to_string(),
                code: self.code(),
                details: None,
            },
        }
    }
}
