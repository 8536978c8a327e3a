use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use tracing::warn;

use crate::{auth::jwt::JwtKeys, error::ApiError, state::AppState, users::store::User};

/// Bearer-token gate. Verifies the token and resolves it to the user record
/// before the handler runs; a token whose subject no longer exists is
/// rejected the same way as an invalid one. Never mutates user state.
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(ApiError::InvalidToken)?;

        let keys = JwtKeys::from_ref(state);
        let claims = keys.verify(&token).map_err(|_| {
            warn!("invalid or expired token");
            ApiError::InvalidToken
        })?;

        let user = state
            .users
            .find_by_id(claims.sub)
            .await?
            .ok_or_else(|| {
                warn!(user_id = %claims.sub, "token subject no longer exists");
                ApiError::InvalidToken
            })?;

        Ok(CurrentUser(user))
    }
}

/// Pulls the token out of `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    let auth = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::store::NewUser;
    use axum::http::Request;
    use uuid::Uuid;

    fn parts_with_auth(value: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/api/user/profile");
        if let Some(v) = value {
            builder = builder.header(axum::http::header::AUTHORIZATION, v);
        }
        let (parts, _) = builder.body(()).expect("request").into_parts();
        parts
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let state = AppState::fake();
        let mut parts = parts_with_auth(None);
        let err = CurrentUser::from_request_parts(&mut parts, &state)
            .await
            .err()
            .expect("rejection");
        assert!(matches!(err, ApiError::InvalidToken));
    }

    #[tokio::test]
    async fn malformed_scheme_is_rejected() {
        let state = AppState::fake();
        let mut parts = parts_with_auth(Some("Basic abc123"));
        assert!(CurrentUser::from_request_parts(&mut parts, &state)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn garbage_token_is_rejected() {
        let state = AppState::fake();
        let mut parts = parts_with_auth(Some("Bearer not-a-jwt"));
        assert!(CurrentUser::from_request_parts(&mut parts, &state)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn token_for_missing_user_is_rejected() {
        let state = AppState::fake();
        let keys = JwtKeys::from_ref(&state);
        let token = keys.sign(Uuid::new_v4()).expect("sign");
        let mut parts = parts_with_auth(Some(&format!("Bearer {token}")));
        let err = CurrentUser::from_request_parts(&mut parts, &state)
            .await
            .err()
            .expect("rejection");
        assert!(matches!(err, ApiError::InvalidToken));
    }

    #[tokio::test]
    async fn valid_token_resolves_user() {
        let state = AppState::fake();
        let user = state
            .users
            .create(NewUser {
                email: "gate@test.com".into(),
                password_hash: Some("hash".into()),
                ..Default::default()
            })
            .await
            .expect("create");
        let keys = JwtKeys::from_ref(&state);
        let token = keys.sign(user.id).expect("sign");

        let mut parts = parts_with_auth(Some(&format!("Bearer {token}")));
        let CurrentUser(resolved) = CurrentUser::from_request_parts(&mut parts, &state)
            .await
            .expect("extract");
        assert_eq!(resolved.id, user.id);
        assert_eq!(resolved.email, "gate@test.com");
    }
}
