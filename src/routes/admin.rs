//! `/admin` routes — users, registrations per course, completions, bot
//! instructions and analytics. Catalog CRUD lives in `admin_catalog`.
//! All routes in this module require the `Admin` role.

use std::collections::BTreeMap;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    routing::{delete, get, put},
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::{
    errors::{AppError, AppResult},
    middleware::{auth_guard::AuthUser, role_guard::require_admin},
    models::{parse_level, CourseCompletion, EnglishLevel, InstructionKind, UserRole},
    services::realtime::{ChangeEvent, ChangeKind, Table},
    state::AppState,
    store::ChatContextStore,
};

pub fn router() -> Router<AppState> {
    use axum::middleware;
    // require_admin reads Extension<AuthUser> (injected by require_auth in mod.rs);
    // it does not need AppState, so plain from_fn is sufficient.
    let admin_guard = middleware::from_fn(require_admin);
    Router::new()
        .route("/admin/users",                          get(list_users))
        .route("/admin/users/{id}",                     put(update_user))
        .route("/admin/courses/{id}/registrations",     get(course_registrations))
        .route("/admin/completions",                    get(list_completions).post(mark_completion))
        .route("/admin/completions/{user_id}/{course_id}", delete(unmark_completion))
        .route("/admin/bot-instructions",               get(list_instructions))
        .route("/admin/bot-instructions/{kind}",        get(get_instruction).put(update_instruction))
        .route("/admin/analytics",                      get(analytics))
        .route_layer(admin_guard)
}

// ── Row types ────────────────────────────────────────────────

#[derive(sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserRow {
    id:                 String,
    email:              String,
    role:               String,
    language:           String,
    is_active:          bool,
    full_name:          Option<String>,
    english_level:      Option<String>,
    registration_count: i64,
    created_at:         NaiveDateTime,
}

#[derive(sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrantRow {
    user_id:       String,
    email:         String,
    full_name:     Option<String>,
    phone:         Option<String>,
    english_level: Option<String>,
    priority:      i32,
    registered_at: NaiveDateTime,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InstructionView {
    kind:    InstructionKind,
    content: String,
}

#[derive(sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
struct CourseStatsRow {
    id:           String,
    title:        String,
    is_active:    bool,
    queue_length: i64,
    completions:  i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Analytics {
    total_users:         i64,
    active_courses:      i64,
    total_registrations: i64,
    total_completions:   i64,
    courses:             Vec<CourseStatsRow>,
    /// Level → number of users; users without a level are under `unknown`.
    english_levels:      BTreeMap<String, i64>,
}

// ── Request bodies ───────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateUserBody {
    is_active: Option<bool>,
    role:      Option<UserRole>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletionBody {
    user_id:   String,
    course_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletionQuery {
    course_id: Option<String>,
    user_id:   Option<String>,
}

#[derive(Deserialize)]
struct InstructionBody {
    content: String,
}

// ── Users ────────────────────────────────────────────────────

const USER_SELECT: &str =
    "SELECT u.id, u.email, u.role, u.language, u.is_active, p.full_name, p.english_level,
            (SELECT COUNT(*) FROM registrations r WHERE r.user_id = u.id) AS registration_count,
            u.created_at
     FROM users u
     LEFT JOIN user_profiles p ON p.user_id = u.id";

async fn list_users(State(state): State<AppState>) -> AppResult<Json<Vec<UserRow>>> {
    let sql = format!("{USER_SELECT} ORDER BY u.role, u.email");
    let rows = sqlx::query_as::<_, UserRow>(&sql).fetch_all(&state.pool).await?;
    Ok(Json(rows))
}

async fn update_user(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(body): Json<UpdateUserBody>,
) -> AppResult<Json<UserRow>> {
    let pool = &state.pool;

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = ?)")
        .bind(&id)
        .fetch_one(pool)
        .await?;
    if !exists {
        return Err(AppError::NotFound);
    }
    if id == admin.user_id && (body.is_active == Some(false) || body.role == Some(UserRole::User)) {
        return Err(AppError::BadRequest("You cannot deactivate or demote your own account".into()));
    }

    if let Some(v) = body.is_active {
        sqlx::query("UPDATE users SET is_active = ? WHERE id = ?")
            .bind(v)
            .bind(&id)
            .execute(pool)
            .await?;
        if !v {
            // Sign the user out everywhere.
            sqlx::query("DELETE FROM user_sessions WHERE user_id = ?")
                .bind(&id)
                .execute(pool)
                .await?;
        }
    }
    if let Some(role) = body.role {
        sqlx::query("UPDATE users SET role = ? WHERE id = ?")
            .bind(role.as_str())
            .bind(&id)
            .execute(pool)
            .await?;
    }

    state.feed.publish(ChangeEvent::new(Table::Users, ChangeKind::Update).user(&id));
    tracing::info!(admin_id = %admin.user_id, user_id = %id, "User updated");

    let sql = format!("{USER_SELECT} WHERE u.id = ?");
    let row = sqlx::query_as::<_, UserRow>(&sql).bind(&id).fetch_one(pool).await?;
    Ok(Json(row))
}

// ── Registrations per course ─────────────────────────────────

/// Registrants of one course, most wanted first, for staff processing.
async fn course_registrations(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
) -> AppResult<Json<Vec<RegistrantRow>>> {
    state
        .store
        .course_by_id(&course_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let rows = sqlx::query_as::<_, RegistrantRow>(
        "SELECT r.user_id, u.email, p.full_name, p.phone, p.english_level,
                r.priority, r.created_at AS registered_at
         FROM registrations r
         JOIN users u ON u.id = r.user_id
         LEFT JOIN user_profiles p ON p.user_id = r.user_id
         WHERE r.course_id = ?
         ORDER BY r.priority, r.created_at",
    )
    .bind(&course_id)
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

// ── Completions ──────────────────────────────────────────────

async fn list_completions(
    State(state): State<AppState>,
    Query(query): Query<CompletionQuery>,
) -> AppResult<Json<Vec<CourseCompletion>>> {
    let rows = sqlx::query_as::<_, CourseCompletion>(
        "SELECT user_id, course_id, completed_at, marked_by
         FROM course_completions
         WHERE (? IS NULL OR course_id = ?)
           AND (? IS NULL OR user_id = ?)
         ORDER BY completed_at DESC",
    )
    .bind(&query.course_id)
    .bind(&query.course_id)
    .bind(&query.user_id)
    .bind(&query.user_id)
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

async fn mark_completion(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(body): Json<CompletionBody>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    state
        .store
        .course_by_id(&body.course_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let removed_registration = state
        .store
        .mark_completion(&body.user_id, &body.course_id, &admin.user_id)
        .await?;
    // Completed courses leave the recommendation pool, which the cache key
    // does not capture.
    state.chat.invalidate(&body.user_id);

    tracing::info!(
        admin_id = %admin.user_id,
        user_id = %body.user_id,
        course_id = %body.course_id,
        removed_registration,
        "Completion marked"
    );
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "removedRegistration": removed_registration })),
    ))
}

async fn unmark_completion(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path((user_id, course_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    state.store.unmark_completion(&user_id, &course_id).await?;
    state.chat.invalidate(&user_id);
    tracing::info!(admin_id = %admin.user_id, %user_id, %course_id, "Completion removed");
    Ok(StatusCode::NO_CONTENT)
}

// ── Bot instructions ─────────────────────────────────────────

fn parse_kind(raw: &str) -> AppResult<InstructionKind> {
    raw.parse().map_err(|_| AppError::NotFound)
}

async fn list_instructions(State(state): State<AppState>) -> AppResult<Json<Vec<InstructionView>>> {
    let mut out = Vec::new();
    for kind in [InstructionKind::Main, InstructionKind::Contacts, InstructionKind::ExternalLinks] {
        let content = state.store.instruction(kind).await?.unwrap_or_default();
        out.push(InstructionView { kind, content });
    }
    Ok(Json(out))
}

async fn get_instruction(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> AppResult<Json<InstructionView>> {
    let kind = parse_kind(&kind)?;
    let content = state.store.instruction(kind).await?.unwrap_or_default();
    Ok(Json(InstructionView { kind, content }))
}

async fn update_instruction(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(kind): Path<String>,
    Json(body): Json<InstructionBody>,
) -> AppResult<Json<InstructionView>> {
    let kind = parse_kind(&kind)?;
    if kind == InstructionKind::Main && body.content.trim().is_empty() {
        return Err(AppError::BadRequest("The main instructions must not be empty".into()));
    }

    sqlx::query(
        "INSERT INTO bot_instructions (kind, content) VALUES (?, ?)
         ON DUPLICATE KEY UPDATE content = VALUES(content)",
    )
    .bind(kind.as_str())
    .bind(&body.content)
    .execute(&state.pool)
    .await?;

    state.chat.invalidate_all();
    state.feed.publish(ChangeEvent::new(Table::BotInstructions, ChangeKind::Update));
    tracing::info!(admin_id = %admin.user_id, kind = kind.as_str(), "Bot instructions updated");

    Ok(Json(InstructionView { kind, content: body.content }))
}

// ── Analytics ────────────────────────────────────────────────

async fn analytics(State(state): State<AppState>) -> AppResult<Json<Analytics>> {
    let pool = &state.pool;

    let total_users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role = 'user'")
        .fetch_one(pool)
        .await?;
    let active_courses: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM courses WHERE is_active = 1")
        .fetch_one(pool)
        .await?;
    let total_registrations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM registrations")
        .fetch_one(pool)
        .await?;
    let total_completions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM course_completions")
        .fetch_one(pool)
        .await?;

    let courses = sqlx::query_as::<_, CourseStatsRow>(
        "SELECT c.id, c.title, c.is_active,
                (SELECT COUNT(*) FROM registrations r WHERE r.course_id = c.id) AS queue_length,
                (SELECT COUNT(*) FROM course_completions cc WHERE cc.course_id = c.id) AS completions
         FROM courses c
         ORDER BY queue_length DESC, c.title",
    )
    .fetch_all(pool)
    .await?;

    let levels: Vec<(Option<String>, i64)> = sqlx::query_as(
        "SELECT p.english_level, COUNT(*)
         FROM users u
         LEFT JOIN user_profiles p ON p.user_id = u.id
         WHERE u.role = 'user'
         GROUP BY p.english_level",
    )
    .fetch_all(pool)
    .await?;

    Ok(Json(Analytics {
        total_users,
        active_courses,
        total_registrations,
        total_completions,
        courses,
        english_levels: level_distribution(levels),
    }))
}

/// Fold raw level counts into one bucket per CEFR level plus `unknown`.
fn level_distribution(rows: Vec<(Option<String>, i64)>) -> BTreeMap<String, i64> {
    let mut out: BTreeMap<String, i64> = EnglishLevel::ALL
        .iter()
        .map(|l| (l.as_str().to_owned(), 0))
        .collect();
    out.insert("unknown".to_owned(), 0);

    for (raw, count) in rows {
        let key = parse_level(raw.as_deref())
            .map(|l| l.as_str().to_owned())
            .unwrap_or_else(|| "unknown".to_owned());
        *out.entry(key).or_insert(0) += count;
    }
    out
}
