use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tower_cookies::{
    cookie::{time::Duration as CookieDuration, SameSite},
    Cookie, Cookies,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::{generate_token, hash_password, validate_password_strength, verify_password},
    db::Db,
    errors::{AppError, AppResult},
    middleware::auth_guard::SESSION_COOKIE,
    models::UserRole,
    services::realtime::{ChangeEvent, ChangeKind, Table},
    state::AppState,
    validation::{normalize_language, CredentialsInput},
};

// ── Session cookie constants ──────────────────────────────────

const SESSION_DAYS: i64 = 30;

// ── Response types ────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserResponse {
    id:       String,
    email:    String,
    role:     UserRole,
    language: String,
}

// ── Database row types ────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct UserRow {
    id:            String,
    email:         String,
    password_hash: String,
    role:          String,
    language:      String,
    is_active:     bool,
}

impl From<UserRow> for UserResponse {
    fn from(row: UserRow) -> Self {
        Self {
            id:       row.id,
            email:    row.email,
            role:     UserRole::from_db(&row.role),
            language: row.language,
        }
    }
}

// ── Router ────────────────────────────────────────────────────

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login",    post(login))
        .route("/auth/logout",   post(logout))
        .route("/auth/me",       get(me))
}

// ── Handlers ──────────────────────────────────────────────────

/// POST /auth/register — create a user account and sign it in.
async fn register(
    State(state): State<AppState>,
    cookies: Cookies,
    Json(mut body): Json<CredentialsInput>,
) -> AppResult<impl IntoResponse> {
    let pool = &state.pool;

    body.email = body.normalized_email();
    body.validate()?;

    // Password strength is relaxed in development for easy testing.
    if !state.config.is_development() {
        validate_password_strength(&body.password)?;
    }

    let language = match body.language.as_deref() {
        Some(raw) => normalize_language(raw)
            .ok_or_else(|| AppError::BadRequest("Unsupported language code".into()))?,
        None => "en".to_owned(),
    };

    let hash = hash_password(&body.password)?;
    let id   = Uuid::new_v4().to_string();

    sqlx::query(
        "INSERT INTO users (id, email, password_hash, role, language, is_active)
         VALUES (?, ?, ?, 'user', ?, 1)",
    )
    .bind(&id)
    .bind(&body.email)
    .bind(hash)
    .bind(&language)
    .execute(pool)
    .await
    .map_err(|e| match AppError::from(e) {
        AppError::Conflict(_) => AppError::Conflict("Email address is already registered".into()),
        other => other,
    })?;

    state.feed.publish(ChangeEvent::new(Table::Users, ChangeKind::Insert).user(&id));
    tracing::info!(user_id = %id, "Registered new user");

    let session_token = create_session(pool, &id, SESSION_DAYS).await?;
    set_session_cookie(&cookies, &session_token, SESSION_DAYS);

    Ok((
        StatusCode::CREATED,
        Json(UserResponse {
            id,
            email: body.email,
            role: UserRole::User,
            language,
        }),
    ))
}

/// POST /auth/login — email + password login.
async fn login(
    State(state): State<AppState>,
    cookies: Cookies,
    Json(body): Json<CredentialsInput>,
) -> AppResult<impl IntoResponse> {
    let pool = &state.pool;

    let row = sqlx::query_as::<_, UserRow>(
        "SELECT id, email, password_hash, role, language, is_active
         FROM users WHERE email = ? LIMIT 1",
    )
    .bind(body.normalized_email())
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::Unauthorized)?;

    if !row.is_active {
        return Err(AppError::Unauthorized);
    }

    verify_password(&body.password, &row.password_hash)?;

    let session_token = create_session(pool, &row.id, SESSION_DAYS).await?;
    set_session_cookie(&cookies, &session_token, SESSION_DAYS);

    Ok(Json(UserResponse::from(row)))
}

/// POST /auth/logout — delete the current session.
async fn logout(
    State(state): State<AppState>,
    cookies: Cookies,
) -> AppResult<impl IntoResponse> {
    if let Some(token) = cookies.get(SESSION_COOKIE).map(|c| c.value().to_owned()) {
        sqlx::query("DELETE FROM user_sessions WHERE token = ?")
            .bind(&token)
            .execute(&state.pool)
            .await?;
    }
    clear_session_cookie(&cookies);
    Ok(StatusCode::NO_CONTENT)
}

/// GET /auth/me — return the currently logged-in user.
async fn me(
    State(state): State<AppState>,
    cookies: Cookies,
) -> AppResult<impl IntoResponse> {
    let token = cookies
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_owned())
        .ok_or(AppError::Unauthorized)?;

    let row = sqlx::query_as::<_, UserRow>(
        "SELECT u.id, u.email, u.password_hash, u.role, u.language, u.is_active
         FROM user_sessions s
         JOIN users u ON u.id = s.user_id
         WHERE s.token = ? AND s.expires_at > UTC_TIMESTAMP() AND u.is_active = 1
         LIMIT 1",
    )
    .bind(&token)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(AppError::Unauthorized)?;

    Ok(Json(UserResponse::from(row)))
}

// ── Internal helpers ──────────────────────────────────────────

async fn create_session(pool: &Db, user_id: &str, days: i64) -> AppResult<String> {
    let token = generate_token();
    let id    = Uuid::new_v4().to_string();
    let expires_at = (Utc::now() + chrono::Duration::days(days)).naive_utc();

    sqlx::query(
        "INSERT INTO user_sessions (id, user_id, token, expires_at) VALUES (?, ?, ?, ?)",
    )
    .bind(id)
    .bind(user_id)
    .bind(&token)
    .bind(expires_at)
    .execute(pool)
    .await?;

    Ok(token)
}

fn set_session_cookie(cookies: &Cookies, token: &str, days: i64) {
    let cookie = Cookie::build((SESSION_COOKIE, token.to_owned()))
        .http_only(true)
        .same_site(SameSite::Strict)
        .path("/")
        .max_age(CookieDuration::days(days))
        .build();
    cookies.add(cookie);
}

fn clear_session_cookie(cookies: &Cookies) {
    let cookie = Cookie::build((SESSION_COOKIE, ""))
        .http_only(true)
        .path("/")
        .max_age(CookieDuration::ZERO)
        .build();
    cookies.add(cookie);
}
