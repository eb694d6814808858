//! `/calendar/events` — events shown on the user calendar.
//!
//! Regular users only ever see public events; admins also see private ones.

use axum::{
    extract::{Extension, Query, State},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::{
    errors::{AppError, AppResult},
    middleware::auth_guard::AuthUser,
    models::{CalendarEvent, UserRole},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/calendar/events", get(list_events))
}

#[derive(Deserialize)]
struct RangeQuery {
    /// Inclusive, `YYYY-MM-DD`.
    from: Option<NaiveDate>,
    /// Inclusive, `YYYY-MM-DD`.
    to:   Option<NaiveDate>,
}

async fn list_events(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(range): Query<RangeQuery>,
) -> AppResult<Json<Vec<CalendarEvent>>> {
    if let (Some(from), Some(to)) = (range.from, range.to) {
        if from > to {
            return Err(AppError::BadRequest("`from` must not be after `to`".into()));
        }
    }
    let include_private = user.role == UserRole::Admin;

    let rows = sqlx::query_as::<_, CalendarEvent>(
        "SELECT id, title, event_date, event_time, link, icon, is_public
         FROM calendar_events
         WHERE (is_public = 1 OR ?)
           AND (? IS NULL OR event_date >= ?)
           AND (? IS NULL OR event_date <= ?)
         ORDER BY event_date, event_time",
    )
    .bind(include_private)
    .bind(range.from)
    .bind(range.from)
    .bind(range.to)
    .bind(range.to)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(rows))
}
