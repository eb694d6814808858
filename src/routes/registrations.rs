//! `/registrations` — the caller's registrations, queue lengths and priorities.

use axum::{
    extract::{Extension, Path, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    errors::AppResult,
    middleware::auth_guard::AuthUser,
    services::registration::{RegistrationManager, RegistrationSnapshot, ToggleOutcome},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/registrations",                        get(get_snapshot))
        .route("/registrations/{course_id}/toggle",     post(toggle))
        .route("/registrations/{course_id}/priority",   put(update_priority))
}

#[derive(Deserialize)]
struct PriorityBody {
    priority: i32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToggleResponse {
    #[serde(flatten)]
    outcome:  ToggleOutcome,
    snapshot: RegistrationSnapshot,
}

async fn get_snapshot(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<RegistrationSnapshot>> {
    let manager = RegistrationManager::load(
        state.store.as_ref(),
        &user.user_id,
        state.config.max_registrations_per_user,
    )
    .await?;
    Ok(Json(manager.into_snapshot()))
}

async fn toggle(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(course_id): Path<String>,
) -> AppResult<Json<ToggleResponse>> {
    let mut manager = RegistrationManager::load(
        state.store.as_ref(),
        &user.user_id,
        state.config.max_registrations_per_user,
    )
    .await?;
    let outcome = manager.toggle_registration(&course_id).await?;
    Ok(Json(ToggleResponse { outcome, snapshot: manager.into_snapshot() }))
}

async fn update_priority(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(course_id): Path<String>,
    Json(body): Json<PriorityBody>,
) -> AppResult<Json<RegistrationSnapshot>> {
    let mut manager = RegistrationManager::load(
        state.store.as_ref(),
        &user.user_id,
        state.config.max_registrations_per_user,
    )
    .await?;
    manager.update_priority(&course_id, body.priority).await?;
    Ok(Json(manager.into_snapshot()))
}
