//! Course catalog as seen by a signed-in user.

use axum::{
    extract::{Extension, Query, State},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    errors::AppResult,
    middleware::auth_guard::AuthUser,
    models::{Course, CourseCategory, Difficulty, EnglishLevel},
    services::registration::{RegistrationManager, RegistrationSnapshot},
    state::AppState,
    store::RegistrationStore,
    validation::normalize_language,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/courses",    get(list_courses))
        .route("/categories", get(list_categories))
}

#[derive(Deserialize)]
pub struct LangQuery {
    pub lang: Option<String>,
}

impl LangQuery {
    /// `?lang=` when valid, otherwise the user's stored preference.
    pub fn resolve(&self, user: &AuthUser) -> String {
        self.lang
            .as_deref()
            .and_then(normalize_language)
            .unwrap_or_else(|| user.language.clone())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CourseView {
    id:                    String,
    title:                 String,
    description:           String,
    category_id:           Option<String>,
    category_name:         Option<String>,
    difficulty:            Difficulty,
    min_english_level:     Option<EnglishLevel>,
    next_session_date:     Option<NaiveDate>,
    queue_length:          i64,
    is_registered:         bool,
    priority:              Option<i32>,
    is_completed:          bool,
    /// Advisory: the caller's level is below the course minimum or unknown.
    english_level_warning: bool,
}

fn course_view(
    course: &Course,
    language: &str,
    snapshot: &RegistrationSnapshot,
    level: Option<EnglishLevel>,
) -> CourseView {
    let (title, description) = course.localized(language);
    CourseView {
        id:                    course.id.clone(),
        title:                 title.to_owned(),
        description:           description.to_owned(),
        category_id:           course.category_id.clone(),
        category_name:         course.category_name.clone(),
        difficulty:            course.difficulty,
        min_english_level:     course.min_english_level,
        next_session_date:     course.next_session_date,
        queue_length:          snapshot.queue_length(&course.id),
        is_registered:         snapshot.is_registered(&course.id),
        priority:              snapshot.priority_of(&course.id),
        is_completed:          snapshot.completed.contains(&course.id),
        english_level_warning: course.min_english_level.is_some()
            && level.map_or(true, |l| !l.meets(course.min_english_level)),
    }
}

async fn list_courses(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<LangQuery>,
) -> AppResult<Json<Vec<CourseView>>> {
    let language = query.resolve(&user);
    let store = state.store.as_ref();

    let courses = store.courses(false).await?;
    let manager = RegistrationManager::load(store, &user.user_id, state.config.max_registrations_per_user).await?;
    let level = store.profile(&user.user_id).await?.and_then(|p| p.english_level);

    let snapshot = manager.snapshot();
    Ok(Json(
        courses
            .iter()
            .map(|c| course_view(c, &language, snapshot, level))
            .collect(),
    ))
}

async fn list_categories(State(state): State<AppState>) -> AppResult<Json<Vec<CourseCategory>>> {
    let rows = sqlx::query_as::<_, CourseCategory>(
        "SELECT id, display_name, icon, color, sort_order
         FROM course_categories
         ORDER BY sort_order, display_name",
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}
