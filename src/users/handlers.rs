use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use time::Date;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{ProfileResponse, UpdateProfileRequest, DATE_FORMAT},
        extractors::CurrentUser,
    },
    error::ApiError,
    state::AppState,
    users::store::UserUpdate,
};

pub fn user_routes() -> Router<AppState> {
    Router::new().route("/user/profile", get(get_profile).put(update_profile))
}

/// The gate already resolved the token to a user, so this is a plain read.
#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn get_profile(CurrentUser(user): CurrentUser) -> Json<ProfileResponse> {
    Json(ProfileResponse {
        user: (&user).into(),
    })
}

// Blank strings mean "leave unchanged", mirroring how the mobile client
// submits untouched form fields.
fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn update_profile(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<ProfileResponse>, ApiError> {
    let date_of_birth = match non_blank(payload.date_of_birth) {
        Some(raw) => Some(Date::parse(&raw, DATE_FORMAT).map_err(|e| {
            warn!(error = %e, "invalid date of birth");
            ApiError::Validation("dateOfBirth must be a YYYY-MM-DD date".into())
        })?),
        None => None,
    };

    let updated = state
        .users
        .update(
            user.id,
            UserUpdate {
                name: non_blank(payload.name),
                phone_number: non_blank(payload.phone_number),
                address: non_blank(payload.address),
                date_of_birth,
                ..Default::default()
            },
        )
        .await?;

    info!("profile updated");
    Ok(Json(ProfileResponse {
        user: (&updated).into(),
    }))
}
