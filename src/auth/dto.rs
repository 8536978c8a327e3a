use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::users::store::User;

/// Request body for signup.
#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Response returned after signup.
#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub user: CreatedUser,
    pub token: String,
}

/// Response returned after login.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: PublicUser,
    pub token: String,
}

/// User fields returned from signup. The password hash is never part of any
/// response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedUser {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Public part of the user returned to the client on login and embedded in
/// the OAuth redirect.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub profile_picture: Option<String>,
}

/// Full profile, as served by verify and the profile routes. Field names are
/// camelCase to match the mobile client's wire contract.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub profile_picture: Option<String>,
    pub phone_number: Option<String>,
    pub address: Option<String>,
    #[serde(with = "date_format")]
    pub date_of_birth: Option<Date>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Wrapper matching the client's `{ "user": ... }` envelope on verify and
/// profile responses.
#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub user: UserProfile,
}

/// Partial profile update. Dates arrive as `YYYY-MM-DD` strings and are
/// parsed (and rejected) in the handler.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
    pub phone_number: Option<String>,
    pub address: Option<String>,
    pub date_of_birth: Option<String>,
}

impl From<&User> for CreatedUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            created_at: user.created_at,
        }
    }
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            profile_picture: user.profile_picture.clone(),
        }
    }
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            profile_picture: user.profile_picture.clone(),
            phone_number: user.phone_number.clone(),
            address: user.address.clone(),
            date_of_birth: user.date_of_birth,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

pub const DATE_FORMAT: &[time::format_description::FormatItem<'static>] =
    time::macros::format_description!("[year]-[month]-[day]");

mod date_format {
    use serde::Serializer;
    use time::Date;

    pub fn serialize<S: Serializer>(date: &Option<Date>, s: S) -> Result<S::Ok, S::Error> {
        match date {
            Some(d) => s.serialize_some(
                &d.format(super::DATE_FORMAT)
                    .map_err(serde::ser::Error::custom)?,
            ),
            None => s.serialize_none(),
        }
    }
}
