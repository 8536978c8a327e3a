use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

/// Error taxonomy for the auth core. Every variant maps to a status code and
/// a JSON `{"error": ...}` body; backend faults are logged and surfaced as a
/// generic 500 so internals never leak to clients.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Email already registered")]
    EmailAlreadyRegistered,

    /// Deliberately generic: unknown email, OAuth-only account and wrong
    /// password all surface this same shape (account-enumeration resistance).
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("No email found in Google profile")]
    NoEmailFromProvider,

    #[error("User not found")]
    NotFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::EmailAlreadyRegistered => StatusCode::CONFLICT,
            ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::InvalidToken => StatusCode::UNAUTHORIZED,
            ApiError::NoEmailFromProvider => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(e) => {
                error!(error = %e, "internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_failures_share_one_shape() {
        // Unknown email, wrong password and OAuth-only accounts must be
        // indistinguishable to the caller.
        let a = ApiError::InvalidCredentials;
        let b = ApiError::InvalidCredentials;
        assert_eq!(a.status(), b.status());
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(
            ApiError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::EmailAlreadyRegistered.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(ApiError::InvalidToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
    }
}
