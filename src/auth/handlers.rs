use axum::{
    extract::{FromRef, Query, State},
    http::{HeaderMap, StatusCode},
    response::Redirect,
    routing::{get, post},
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, instrument, warn};
use url::Url;

use crate::{
    auth::{
        dto::{
            AuthResponse, LoginRequest, ProfileResponse, PublicUser, SignupRequest,
            SignupResponse,
        },
        extractors::bearer_token,
        jwt::JwtKeys,
        oauth::complete_oauth,
        password::{hash_password, verify_password},
    },
    error::ApiError,
    state::AppState,
    users::store::NewUser,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/google", get(google))
        .route("/auth/google/callback", get(google_callback))
        .route("/auth/verify", get(verify))
}

fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    Json(mut payload): Json<SignupRequest>,
) -> Result<(StatusCode, Json<SignupResponse>), ApiError> {
    payload.email = payload.email.trim().to_lowercase();

    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(ApiError::Validation("Valid email is required".into()));
    }
    if payload.password.len() < 6 {
        warn!("password too short");
        return Err(ApiError::Validation(
            "Password must be at least 6 characters".into(),
        ));
    }

    // Pre-check for a friendly conflict; the unique constraint backstops the
    // concurrent-signup race inside create().
    if state.users.find_by_email(&payload.email).await?.is_some() {
        warn!(email = %payload.email, "email already registered");
        return Err(ApiError::EmailAlreadyRegistered);
    }

    let hash = hash_password(&payload.password)?;
    let name = payload
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());

    let user = state
        .users
        .create(NewUser {
            email: payload.email.clone(),
            password_hash: Some(hash),
            name,
            ..Default::default()
        })
        .await?;

    let keys = JwtKeys::from_ref(&state);
    let token = keys.sign(user.id)?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(SignupResponse {
            user: (&user).into(),
            token,
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(mut payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    payload.email = payload.email.trim().to_lowercase();

    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(ApiError::Validation("Valid email is required".into()));
    }

    // Unknown email, OAuth-only account and wrong password all take the same
    // exit so callers cannot probe which emails are registered.
    let Some(user) = state.users.find_by_email(&payload.email).await? else {
        warn!(email = %payload.email, "login unknown email");
        return Err(ApiError::InvalidCredentials);
    };

    let Some(hash) = user.password_hash.as_deref() else {
        warn!(user_id = %user.id, "login against oauth-only account");
        return Err(ApiError::InvalidCredentials);
    };

    if !verify_password(&payload.password, hash) {
        warn!(user_id = %user.id, "login invalid password");
        return Err(ApiError::InvalidCredentials);
    }

    let keys = JwtKeys::from_ref(&state);
    let token = keys.sign(user.id)?;

    info!(user_id = %user.id, email = %user.email, "user logged in");
    Ok(Json(AuthResponse {
        user: (&user).into(),
        token,
    }))
}

#[instrument(skip(state))]
pub async fn google(State(state): State<AppState>) -> Redirect {
    Redirect::to(&state.oauth.authorize_url())
}

#[derive(Debug, Deserialize)]
pub struct GoogleCallbackQuery {
    pub code: Option<String>,
    pub error: Option<String>,
}

#[instrument(skip(state, query))]
pub async fn google_callback(
    State(state): State<AppState>,
    Query(query): Query<GoogleCallbackQuery>,
) -> Result<Redirect, ApiError> {
    if let Some(err) = query.error {
        warn!(error = %err, "google sign-in denied");
        return Err(ApiError::Validation(format!("Google sign-in failed: {err}")));
    }
    let code = query
        .code
        .ok_or_else(|| ApiError::Validation("Missing authorization code".into()))?;

    let profile = state.oauth.exchange_code(&code).await?;
    let user = complete_oauth(state.users.as_ref(), profile).await?;

    let keys = JwtKeys::from_ref(&state);
    let token = keys.sign(user.id)?;

    // The client extracts the token and user summary from the redirect query.
    let summary =
        serde_json::to_string(&PublicUser::from(&user)).map_err(anyhow::Error::from)?;
    let mut url =
        Url::parse(&state.config.google.frontend_url).map_err(anyhow::Error::from)?;
    url.set_path("/auth/callback");
    url.query_pairs_mut()
        .append_pair("token", &token)
        .append_pair("user", &summary);

    info!(user_id = %user.id, "google sign-in complete");
    Ok(Redirect::to(url.as_str()))
}

#[instrument(skip(state, headers))]
pub async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ProfileResponse>, ApiError> {
    let token = bearer_token(&headers).ok_or(ApiError::InvalidToken)?;

    let keys = JwtKeys::from_ref(&state);
    let claims = keys.verify(&token).map_err(|_| {
        warn!("invalid or expired token");
        ApiError::InvalidToken
    })?;

    let user = state
        .users
        .find_by_id(claims.sub)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(ProfileResponse {
        user: (&user).into(),
    }))
}
