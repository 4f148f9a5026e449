//! Relay error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ledgersync_core::sync::auth::AuthError;
use ledgersync_core::sync::models::ConflictResponse;

/// Relay server error types mapped to HTTP status codes.
#[derive(Debug)]
pub enum RelayError {
    Database(String),
    Auth(AuthError),
    Forbidden(String),
    NotFound(String),
    /// A push whose cursor is behind the ledger head
    Stale { head: u64 },
    RateLimited,
    QuotaExceeded,
    BadRequest(String),
    Internal(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "Database error: {}", e),
            Self::Auth(e) => write!(f, "Auth error: {}", e),
            Self::Forbidden(e) => write!(f, "Forbidden: {}", e),
            Self::NotFound(e) => write!(f, "Not found: {}", e),
            Self::Stale { head } => write!(f, "Push is behind ledger head {}", head),
            Self::RateLimited => write!(f, "Rate limited"),
            Self::QuotaExceeded => write!(f, "Ledger message quota exceeded"),
            Self::BadRequest(e) => write!(f, "Bad request: {}", e),
            Self::Internal(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl std::error::Error for RelayError {}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Stale { head } => {
                let body = ConflictResponse {
                    error: "conflict".to_string(),
                    head: *head,
                };
                return (StatusCode::CONFLICT, axum::Json(body)).into_response();
            }
            Self::Database(e) | Self::Internal(e) => {
                tracing::error!(error = %e, "Relay request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            Self::Auth(e) => (StatusCode::UNAUTHORIZED, e.to_string()),
            Self::Forbidden(e) => (StatusCode::FORBIDDEN, e.clone()),
            Self::NotFound(e) => (StatusCode::NOT_FOUND, e.clone()),
            Self::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            Self::QuotaExceeded => (StatusCode::INSUFFICIENT_STORAGE, self.to_string()),
            Self::BadRequest(e) => (StatusCode::BAD_REQUEST, e.clone()),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<AuthError> for RelayError {
    fn from(e: AuthError) -> Self {
        Self::Auth(e)
    }
}
