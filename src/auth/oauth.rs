use axum::async_trait;
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::{
    config::GoogleConfig,
    error::ApiError,
    users::store::{NewUser, User, UserStore, UserUpdate},
};

const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USER_INFO_URL: &str = "https://www.googleapis.com/oauth2/v3/userinfo";

/// Identity handed back by the provider after the code exchange. `email` is
/// only populated when the provider reports it as verified.
#[derive(Debug, Clone)]
pub struct GoogleProfile {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
}

#[async_trait]
pub trait GoogleClient: Send + Sync {
    fn authorize_url(&self) -> String;
    async fn exchange_code(&self, code: &str) -> anyhow::Result<GoogleProfile>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    email: Option<String>,
    email_verified: Option<bool>,
    name: Option<String>,
    picture: Option<String>,
}

pub struct GoogleOAuth {
    http: reqwest::Client,
    config: GoogleConfig,
}

impl GoogleOAuth {
    pub fn new(config: GoogleConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl GoogleClient for GoogleOAuth {
    fn authorize_url(&self) -> String {
        let url = Url::parse_with_params(
            AUTHORIZE_URL,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.callback_url.as_str()),
                ("response_type", "code"),
                ("scope", "openid email profile"),
            ],
        )
        .expect("authorize url is a valid base");
        url.into()
    }

    async fn exchange_code(&self, code: &str) -> anyhow::Result<GoogleProfile> {
        let token: TokenResponse = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.config.callback_url.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let info: UserInfo = self
            .http
            .get(USER_INFO_URL)
            .bearer_auth(&token.access_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let email = match info.email_verified {
            Some(false) => None,
            _ => info.email,
        };
        Ok(GoogleProfile {
            id: info.sub,
            email,
            name: info.name,
            picture: info.picture,
        })
    }
}

/// Create-or-link: reconcile a provider identity with a local user record.
///
/// - no user for the email: create one with `google_id` and no password;
/// - user without a `google_id`: link it, backfilling name/picture only
///   where the user hasn't set them;
/// - user already linked (even to a different google id): leave unchanged,
///   first-linked-wins.
pub async fn complete_oauth(
    store: &dyn UserStore,
    profile: GoogleProfile,
) -> Result<User, ApiError> {
    let email = profile
        .email
        .as_deref()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .ok_or(ApiError::NoEmailFromProvider)?;

    match store.find_by_email(&email).await? {
        None => {
            info!(email = %email, "creating user from google profile");
            store
                .create(NewUser {
                    email,
                    password_hash: None,
                    google_id: Some(profile.id),
                    name: profile.name,
                    profile_picture: profile.picture,
                })
                .await
        }
        Some(user) if user.google_id.is_none() => {
            info!(user_id = %user.id, "linking google identity to existing user");
            store
                .update(
                    user.id,
                    UserUpdate {
                        google_id: Some(profile.id),
                        name: if user.name.is_none() { profile.name } else { None },
                        profile_picture: if user.profile_picture.is_none() {
                            profile.picture
                        } else {
                            None
                        },
                        ..Default::default()
                    },
                )
                .await
        }
        Some(user) => Ok(user),
    }
}
