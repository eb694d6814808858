//! `/admin` catalog routes — courses, translations, course sessions,
//! categories and calendar events. All routes require the `Admin` role.
//!
//! Every write publishes a change on the feed so open views re-fetch.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    errors::{AppError, AppResult},
    middleware::{auth_guard::AuthUser, role_guard::require_admin},
    models::{
        CalendarEvent, Course, CourseCategory, CourseSession, CourseTranslation, Difficulty,
        EnglishLevel, SessionStatus,
    },
    services::realtime::{ChangeEvent, ChangeKind, Table},
    state::AppState,
    validation::normalize_language,
};

pub fn router() -> Router<AppState> {
    use axum::middleware;
    let admin_guard = middleware::from_fn(require_admin);
    Router::new()
        .route("/admin/courses",                              get(list_courses).post(create_course))
        .route("/admin/courses/{id}",                         put(update_course).delete(delete_course))
        .route("/admin/courses/{id}/translations/{language}", put(upsert_translation).delete(delete_translation))
        .route("/admin/courses/{id}/sessions",                get(list_sessions).post(create_session))
        .route("/admin/sessions/{id}",                        put(update_session).delete(delete_session))
        .route("/admin/categories",                           get(list_categories).post(create_category))
        .route("/admin/categories/{id}",                      put(update_category).delete(delete_category))
        .route("/admin/calendar/events",                      post(create_event))
        .route("/admin/calendar/events/{id}",                 put(update_event).delete(delete_event))
        .route_layer(admin_guard)
}

// ── Row types ────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct SessionRow {
    id:                 String,
    course_id:          String,
    session_date:       NaiveDate,
    capacity:           i32,
    current_enrollment: i32,
    status:             String,
}

impl From<SessionRow> for CourseSession {
    fn from(row: SessionRow) -> Self {
        CourseSession {
            status:             SessionStatus::from_db(&row.status),
            id:                 row.id,
            course_id:          row.course_id,
            session_date:       row.session_date,
            capacity:           row.capacity,
            current_enrollment: row.current_enrollment,
        }
    }
}

/// What a delete request actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Removal {
    Deleted,
    /// Course kept but hidden from users.
    Deactivated,
    /// Session kept for history.
    Archived,
}

#[derive(Serialize)]
struct RemovalResponse {
    outcome: Removal,
}

/// Courses referenced by registrations or completions are never dropped.
fn course_removal(references: i64) -> Removal {
    if references > 0 { Removal::Deactivated } else { Removal::Deleted }
}

/// Sessions with enrolled users are archived, never dropped.
fn session_removal(current_enrollment: i32) -> Removal {
    if current_enrollment > 0 { Removal::Archived } else { Removal::Deleted }
}

// ── Request bodies ───────────────────────────────────────────

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CourseBody {
    #[validate(length(min = 1, max = 200, message = "Title must be between 1 and 200 characters"))]
    title:             String,
    category_id:       Option<String>,
    #[serde(default)]
    description:       String,
    difficulty:        Difficulty,
    min_english_level: Option<EnglishLevel>,
    next_session_date: Option<NaiveDate>,
    #[serde(default = "default_true")]
    is_active:         bool,
    #[serde(default)]
    translations:      Vec<CourseTranslation>,
}

#[derive(Deserialize, Validate)]
struct TranslationBody {
    #[validate(length(min = 1, max = 200, message = "Title must be between 1 and 200 characters"))]
    title:       String,
    description: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    #[serde(default, alias = "show_archived")]
    show_archived: bool,
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct SessionBody {
    session_date:       NaiveDate,
    #[validate(range(min = 1, max = 10000, message = "Capacity must be at least 1"))]
    capacity:           i32,
    #[serde(default)]
    #[validate(range(min = 0, message = "Enrollment cannot be negative"))]
    current_enrollment: i32,
    status:             Option<SessionStatus>,
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CategoryBody {
    #[validate(length(min = 1, max = 120, message = "Name must be between 1 and 120 characters"))]
    display_name: String,
    #[validate(length(min = 1, max = 64))]
    icon:         String,
    #[validate(length(min = 1, max = 32))]
    color:        String,
    #[serde(default)]
    sort_order:   i32,
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct EventBody {
    #[validate(length(min = 1, max = 200, message = "Title must be between 1 and 200 characters"))]
    title:      String,
    event_date: NaiveDate,
    #[validate(custom(function = "crate::validation::validate_time_of_day"))]
    event_time: Option<String>,
    #[validate(custom(function = "crate::validation::validate_link"))]
    link:       Option<String>,
    #[serde(default = "default_event_icon")]
    icon:       String,
    #[serde(default = "default_true")]
    is_public:  bool,
}

fn default_true() -> bool {
    true
}

fn default_event_icon() -> String {
    "calendar".into()
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_owned()).filter(|s| !s.is_empty())
}

fn language_param(raw: &str) -> AppResult<String> {
    normalize_language(raw).ok_or_else(|| AppError::BadRequest(format!("Invalid language '{raw}'")))
}

// ── Courses ──────────────────────────────────────────────────

async fn list_courses(State(state): State<AppState>) -> AppResult<Json<Vec<Course>>> {
    Ok(Json(state.store.courses(true).await?))
}

async fn assert_category_exists(pool: &crate::db::Db, category_id: &Option<String>) -> AppResult<()> {
    let Some(id) = category_id else {
        return Ok(());
    };
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM course_categories WHERE id = ?)")
        .bind(id)
        .fetch_one(pool)
        .await?;
    if !exists {
        return Err(AppError::BadRequest("Unknown category".into()));
    }
    Ok(())
}

/// Normalize every translation, or reject the batch before anything is written.
fn checked_translations(translations: &[CourseTranslation]) -> AppResult<Vec<CourseTranslation>> {
    translations
        .iter()
        .map(|t| {
            let language = language_param(&t.language)?;
            let title = t.title.trim();
            if title.is_empty() {
                return Err(AppError::BadRequest(format!("Translation '{language}' needs a title")));
            }
            Ok(CourseTranslation {
                language,
                title:       title.to_owned(),
                description: non_blank(t.description.clone()),
            })
        })
        .collect()
}

/// Upsert already-checked translations inside the caller's transaction.
async fn write_translations(
    tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
    course_id: &str,
    translations: &[CourseTranslation],
) -> AppResult<()> {
    for t in translations {
        sqlx::query(
            "INSERT INTO course_translations (course_id, language, title, description)
             VALUES (?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE title = VALUES(title), description = VALUES(description)",
        )
        .bind(course_id)
        .bind(&t.language)
        .bind(&t.title)
        .bind(&t.description)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn create_course(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(body): Json<CourseBody>,
) -> AppResult<(StatusCode, Json<Course>)> {
    body.validate()?;
    let translations = checked_translations(&body.translations)?;
    let pool = &state.pool;
    let category_id = non_blank(body.category_id.clone());
    assert_category_exists(pool, &category_id).await?;

    let id = Uuid::new_v4().to_string();
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO courses
            (id, title, category_id, description, difficulty, min_english_level, next_session_date, is_active)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(body.title.trim())
    .bind(&category_id)
    .bind(&body.description)
    .bind(body.difficulty.as_str())
    .bind(body.min_english_level.map(EnglishLevel::as_str))
    .bind(body.next_session_date)
    .bind(body.is_active)
    .execute(&mut *tx)
    .await?;
    write_translations(&mut tx, &id, &translations).await?;
    tx.commit().await?;

    state.feed.publish(ChangeEvent::new(Table::Courses, ChangeKind::Insert).course(&id));
    state.chat.invalidate_all();
    tracing::info!(admin_id = %admin.user_id, course_id = %id, "Course created");

    let course = state.store.course_by_id(&id).await?.ok_or(AppError::NotFound)?;
    Ok((StatusCode::CREATED, Json(course)))
}

async fn update_course(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(body): Json<CourseBody>,
) -> AppResult<Json<Course>> {
    body.validate()?;
    let translations = checked_translations(&body.translations)?;
    let pool = &state.pool;
    state.store.course_by_id(&id).await?.ok_or(AppError::NotFound)?;
    let category_id = non_blank(body.category_id.clone());
    assert_category_exists(pool, &category_id).await?;

    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE courses
         SET title = ?, category_id = ?, description = ?, difficulty = ?,
             min_english_level = ?, next_session_date = ?, is_active = ?
         WHERE id = ?",
    )
    .bind(body.title.trim())
    .bind(&category_id)
    .bind(&body.description)
    .bind(body.difficulty.as_str())
    .bind(body.min_english_level.map(EnglishLevel::as_str))
    .bind(body.next_session_date)
    .bind(body.is_active)
    .bind(&id)
    .execute(&mut *tx)
    .await?;
    write_translations(&mut tx, &id, &translations).await?;
    tx.commit().await?;

    state.feed.publish(ChangeEvent::new(Table::Courses, ChangeKind::Update).course(&id));
    // Prompts embed fields the cache key does not cover.
    state.chat.invalidate_all();
    tracing::info!(admin_id = %admin.user_id, course_id = %id, "Course updated");

    let course = state.store.course_by_id(&id).await?.ok_or(AppError::NotFound)?;
    Ok(Json(course))
}

async fn delete_course(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<String>,
) -> AppResult<Json<RemovalResponse>> {
    let pool = &state.pool;
    state.store.course_by_id(&id).await?.ok_or(AppError::NotFound)?;

    let references: i64 = sqlx::query_scalar(
        "SELECT (SELECT COUNT(*) FROM registrations WHERE course_id = ?)
              + (SELECT COUNT(*) FROM course_completions WHERE course_id = ?)",
    )
    .bind(&id)
    .bind(&id)
    .fetch_one(pool)
    .await?;

    let outcome = course_removal(references);
    match outcome {
        Removal::Deactivated => {
            sqlx::query("UPDATE courses SET is_active = 0 WHERE id = ?")
                .bind(&id)
                .execute(pool)
                .await?;
            state.feed.publish(ChangeEvent::new(Table::Courses, ChangeKind::Update).course(&id));
        }
        _ => {
            sqlx::query("DELETE FROM courses WHERE id = ?").bind(&id).execute(pool).await?;
            state.feed.publish(ChangeEvent::new(Table::Courses, ChangeKind::Delete).course(&id));
        }
    }
    state.chat.invalidate_all();
    tracing::info!(admin_id = %admin.user_id, course_id = %id, ?outcome, "Course removed");
    Ok(Json(RemovalResponse { outcome }))
}

async fn upsert_translation(
    State(state): State<AppState>,
    Path((id, language)): Path<(String, String)>,
    Json(body): Json<TranslationBody>,
) -> AppResult<Json<Course>> {
    body.validate()?;
    state.store.course_by_id(&id).await?.ok_or(AppError::NotFound)?;

    let translations = checked_translations(&[CourseTranslation {
        language,
        title:       body.title,
        description: body.description,
    }])?;
    let mut tx = state.pool.begin().await?;
    write_translations(&mut tx, &id, &translations).await?;
    tx.commit().await?;

    state.feed.publish(ChangeEvent::new(Table::Courses, ChangeKind::Update).course(&id));
    state.chat.invalidate_all();

    let course = state.store.course_by_id(&id).await?.ok_or(AppError::NotFound)?;
    Ok(Json(course))
}

async fn delete_translation(
    State(state): State<AppState>,
    Path((id, language)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    let language = language_param(&language)?;
    let affected = sqlx::query("DELETE FROM course_translations WHERE course_id = ? AND language = ?")
        .bind(&id)
        .bind(&language)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(AppError::NotFound);
    }

    state.feed.publish(ChangeEvent::new(Table::Courses, ChangeKind::Update).course(&id));
    state.chat.invalidate_all();
    Ok(StatusCode::NO_CONTENT)
}

// ── Course sessions ──────────────────────────────────────────

const SESSION_SELECT: &str =
    "SELECT id, course_id, session_date, capacity, current_enrollment, status FROM course_sessions";

async fn fetch_session(pool: &crate::db::Db, id: &str) -> AppResult<CourseSession> {
    let sql = format!("{SESSION_SELECT} WHERE id = ?");
    sqlx::query_as::<_, SessionRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .map(CourseSession::from)
        .ok_or(AppError::NotFound)
}

/// Archived sessions are history: listed only on request.
fn visible_sessions(sessions: Vec<CourseSession>, show_archived: bool) -> Vec<CourseSession> {
    sessions
        .into_iter()
        .filter(|s| show_archived || s.status == SessionStatus::Active)
        .collect()
}

fn check_enrollment(body: &SessionBody) -> AppResult<()> {
    if body.current_enrollment > body.capacity {
        return Err(AppError::BadRequest("Enrollment cannot exceed capacity".into()));
    }
    Ok(())
}

async fn list_sessions(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> AppResult<Json<Vec<CourseSession>>> {
    let sql = format!("{SESSION_SELECT} WHERE course_id = ? ORDER BY session_date");
    let rows = sqlx::query_as::<_, SessionRow>(&sql)
        .bind(&course_id)
        .fetch_all(&state.pool)
        .await?;
    let sessions = rows.into_iter().map(CourseSession::from).collect();
    Ok(Json(visible_sessions(sessions, query.show_archived)))
}

async fn create_session(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(course_id): Path<String>,
    Json(body): Json<SessionBody>,
) -> AppResult<(StatusCode, Json<CourseSession>)> {
    body.validate()?;
    check_enrollment(&body)?;
    state.store.course_by_id(&course_id).await?.ok_or(AppError::NotFound)?;

    let id = Uuid::new_v4().to_string();
    let status = body.status.unwrap_or(SessionStatus::Active);
    sqlx::query(
        "INSERT INTO course_sessions (id, course_id, session_date, capacity, current_enrollment, status)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&course_id)
    .bind(body.session_date)
    .bind(body.capacity)
    .bind(body.current_enrollment)
    .bind(status.as_str())
    .execute(&state.pool)
    .await?;

    state.feed.publish(ChangeEvent::new(Table::CourseSessions, ChangeKind::Insert).course(&course_id));
    state.chat.invalidate_all();
    tracing::info!(admin_id = %admin.user_id, %course_id, session_id = %id, "Course session created");

    Ok((StatusCode::CREATED, Json(fetch_session(&state.pool, &id).await?)))
}

async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SessionBody>,
) -> AppResult<Json<CourseSession>> {
    body.validate()?;
    check_enrollment(&body)?;
    let pool = &state.pool;
    let current = fetch_session(pool, &id).await?;

    sqlx::query(
        "UPDATE course_sessions
         SET session_date = ?, capacity = ?, current_enrollment = ?, status = ?
         WHERE id = ?",
    )
    .bind(body.session_date)
    .bind(body.capacity)
    .bind(body.current_enrollment)
    .bind(body.status.unwrap_or(current.status).as_str())
    .bind(&id)
    .execute(pool)
    .await?;

    state.feed.publish(ChangeEvent::new(Table::CourseSessions, ChangeKind::Update).course(&current.course_id));
    state.chat.invalidate_all();
    Ok(Json(fetch_session(pool, &id).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<String>,
) -> AppResult<Json<RemovalResponse>> {
    let pool = &state.pool;
    let session = fetch_session(pool, &id).await?;

    let outcome = session_removal(session.current_enrollment);
    let kind = match outcome {
        Removal::Archived => {
            sqlx::query("UPDATE course_sessions SET status = 'archived' WHERE id = ?")
                .bind(&id)
                .execute(pool)
                .await?;
            ChangeKind::Update
        }
        _ => {
            sqlx::query("DELETE FROM course_sessions WHERE id = ?").bind(&id).execute(pool).await?;
            ChangeKind::Delete
        }
    };

    state.feed.publish(ChangeEvent::new(Table::CourseSessions, kind).course(&session.course_id));
    state.chat.invalidate_all();
    tracing::info!(admin_id = %admin.user_id, session_id = %id, ?outcome, "Course session removed");
    Ok(Json(RemovalResponse { outcome }))
}

// ── Categories ───────────────────────────────────────────────

async fn list_categories(State(state): State<AppState>) -> AppResult<Json<Vec<CourseCategory>>> {
    let rows = sqlx::query_as::<_, CourseCategory>(
        "SELECT id, display_name, icon, color, sort_order FROM course_categories
         ORDER BY sort_order, display_name",
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

async fn fetch_category(pool: &crate::db::Db, id: &str) -> AppResult<CourseCategory> {
    sqlx::query_as::<_, CourseCategory>(
        "SELECT id, display_name, icon, color, sort_order FROM course_categories WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound)
}

async fn create_category(
    State(state): State<AppState>,
    Json(body): Json<CategoryBody>,
) -> AppResult<(StatusCode, Json<CourseCategory>)> {
    body.validate()?;
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO course_categories (id, display_name, icon, color, sort_order) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(body.display_name.trim())
    .bind(&body.icon)
    .bind(&body.color)
    .bind(body.sort_order)
    .execute(&state.pool)
    .await?;

    state.feed.publish(ChangeEvent::new(Table::CourseCategories, ChangeKind::Insert));
    Ok((StatusCode::CREATED, Json(fetch_category(&state.pool, &id).await?)))
}

async fn update_category(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CategoryBody>,
) -> AppResult<Json<CourseCategory>> {
    body.validate()?;
    let pool = &state.pool;
    fetch_category(pool, &id).await?;

    sqlx::query(
        "UPDATE course_categories SET display_name = ?, icon = ?, color = ?, sort_order = ? WHERE id = ?",
    )
    .bind(body.display_name.trim())
    .bind(&body.icon)
    .bind(&body.color)
    .bind(body.sort_order)
    .bind(&id)
    .execute(pool)
    .await?;

    state.feed.publish(ChangeEvent::new(Table::CourseCategories, ChangeKind::Update));
    Ok(Json(fetch_category(pool, &id).await?))
}

async fn delete_category(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let affected = sqlx::query("DELETE FROM course_categories WHERE id = ?")
        .bind(&id)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(AppError::NotFound);
    }

    // Courses in the category fall back to no category.
    state.feed.publish(ChangeEvent::new(Table::CourseCategories, ChangeKind::Delete));
    state.feed.publish(ChangeEvent::new(Table::Courses, ChangeKind::Update));
    Ok(StatusCode::NO_CONTENT)
}

// ── Calendar events ──────────────────────────────────────────

async fn fetch_event(pool: &crate::db::Db, id: &str) -> AppResult<CalendarEvent> {
    sqlx::query_as::<_, CalendarEvent>(
        "SELECT id, title, event_date, event_time, link, icon, is_public FROM calendar_events WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound)
}

fn clean_event(mut body: EventBody) -> EventBody {
    body.event_time = non_blank(body.event_time);
    body.link = non_blank(body.link);
    body
}

async fn create_event(
    State(state): State<AppState>,
    Json(body): Json<EventBody>,
) -> AppResult<(StatusCode, Json<CalendarEvent>)> {
    let body = clean_event(body);
    body.validate()?;

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO calendar_events (id, title, event_date, event_time, link, icon, is_public)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(body.title.trim())
    .bind(body.event_date)
    .bind(&body.event_time)
    .bind(&body.link)
    .bind(&body.icon)
    .bind(body.is_public)
    .execute(&state.pool)
    .await?;

    state.feed.publish(ChangeEvent::new(Table::CalendarEvents, ChangeKind::Insert));
    // Upcoming public events are part of every prompt.
    state.chat.invalidate_all();
    Ok((StatusCode::CREATED, Json(fetch_event(&state.pool, &id).await?)))
}

async fn update_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<EventBody>,
) -> AppResult<Json<CalendarEvent>> {
    let body = clean_event(body);
    body.validate()?;
    let pool = &state.pool;
    fetch_event(pool, &id).await?;

    sqlx::query(
        "UPDATE calendar_events
         SET title = ?, event_date = ?, event_time = ?, link = ?, icon = ?, is_public = ?
         WHERE id = ?",
    )
    .bind(body.title.trim())
    .bind(body.event_date)
    .bind(&body.event_time)
    .bind(&body.link)
    .bind(&body.icon)
    .bind(body.is_public)
    .bind(&id)
    .execute(pool)
    .await?;

    state.feed.publish(ChangeEvent::new(Table::CalendarEvents, ChangeKind::Update));
    state.chat.invalidate_all();
    Ok(Json(fetch_event(pool, &id).await?))
}

async fn delete_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let affected = sqlx::query("DELETE FROM calendar_events WHERE id = ?")
        .bind(&id)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(AppError::NotFound);
    }

    state.feed.publish(ChangeEvent::new(Table::CalendarEvents, ChangeKind::Delete));
    state.chat.invalidate_all();
    Ok(StatusCode::NO_CONTENT)
}
