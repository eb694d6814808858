//! `/profile` — the caller's personal data and English level.
//!
//! `GET   /profile`          — profile plus the derived `isComplete`
//! `PUT   /profile`          — validate and replace the profile
//! `PATCH /profile/language` — change the preferred UI language

use axum::{
    extract::{Extension, State},
    routing::{get, patch},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{AppError, AppResult},
    middleware::auth_guard::AuthUser,
    models::UserProfile,
    services::realtime::{ChangeEvent, ChangeKind, Table},
    state::AppState,
    store::RegistrationStore,
    validation::{normalize_language, ProfileInput},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/profile",          get(get_profile).put(update_profile))
        .route("/profile/language", patch(update_language))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    #[serde(flatten)]
    profile:     UserProfile,
    is_complete: bool,
}

impl From<UserProfile> for ProfileResponse {
    fn from(profile: UserProfile) -> Self {
        Self { is_complete: profile.is_complete(), profile }
    }
}

#[derive(Deserialize)]
struct LanguageBody {
    language: String,
}

async fn get_profile(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<ProfileResponse>> {
    let profile = state
        .store
        .profile(&user.user_id)
        .await?
        .unwrap_or_else(|| UserProfile { user_id: user.user_id.clone(), ..Default::default() });
    Ok(Json(profile.into()))
}

async fn update_profile(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<ProfileInput>,
) -> AppResult<Json<ProfileResponse>> {
    let profile = body.into_profile(&user.user_id)?;
    state.store.save_profile(&profile).await?;
    // The English level is part of the chat cache key, so no explicit
    // invalidation is needed here.
    tracing::info!(user_id = %user.user_id, complete = profile.is_complete(), "Profile updated");
    Ok(Json(profile.into()))
}

async fn update_language(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<LanguageBody>,
) -> AppResult<Json<serde_json::Value>> {
    let language = normalize_language(&body.language)
        .ok_or_else(|| AppError::BadRequest("Unsupported language code".into()))?;

    sqlx::query("UPDATE users SET language = ? WHERE id = ?")
        .bind(&language)
        .bind(&user.user_id)
        .execute(&state.pool)
        .await?;

    state.feed.publish(ChangeEvent::new(Table::Users, ChangeKind::Update).user(&user.user_id));
    Ok(Json(serde_json::json!({ "language": language })))
}
