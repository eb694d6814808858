//! `GET /realtime` — server-sent change notifications.
//!
//! `?tables=courses,registrations&event=insert&debounce_ms=150&mine=true&course_id=...`
//!
//! The stream opens with a `ready` event and then emits one `change` event
//! per debounced burst of matching writes. Events carry no row data: clients
//! re-fetch whatever they display. The subscription is torn down as soon as
//! the client disconnects.

use std::{convert::Infallible, time::Duration};

use axum::{
    extract::{Extension, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{
    config::clamp_debounce,
    errors::{AppError, AppResult},
    middleware::auth_guard::AuthUser,
    models::UserRole,
    services::realtime::{ChangeKind, RowFilter, SubscriptionSpec, Table},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/realtime", get(subscribe))
}

#[derive(Deserialize)]
struct RealtimeQuery {
    /// Comma-separated table names.
    tables:      String,
    /// Only this kind of change; all kinds when absent.
    event:       Option<ChangeKind>,
    debounce_ms: Option<u64>,
    /// Only the caller's own rows, where the table has a user column.
    #[serde(default)]
    mine:        bool,
    course_id:   Option<String>,
}

fn has_user_column(table: Table) -> bool {
    matches!(
        table,
        Table::Users | Table::Registrations | Table::CourseCompletions | Table::UserProfiles
    )
}

fn has_course_column(table: Table) -> bool {
    matches!(
        table,
        Table::Courses | Table::CourseSessions | Table::Registrations | Table::CourseCompletions
    )
}

fn build_specs(query: &RealtimeQuery, user: &AuthUser) -> AppResult<Vec<SubscriptionSpec>> {
    let mut tables: Vec<Table> = query
        .tables
        .split(',')
        .filter(|t| !t.trim().is_empty())
        .map(|t| t.parse::<Table>().map_err(AppError::BadRequest))
        .collect::<AppResult<_>>()?;
    tables.sort_by_key(|t| t.as_str());
    tables.dedup();

    if tables.is_empty() {
        return Err(AppError::BadRequest("At least one table is required".into()));
    }
    let admin_only = tables
        .iter()
        .any(|t| matches!(t, Table::Users | Table::BotInstructions));
    if admin_only && user.role != UserRole::Admin {
        return Err(AppError::Forbidden);
    }

    Ok(tables
        .into_iter()
        .map(|table| {
            let spec = match query.event {
                Some(kind) => SubscriptionSpec::table(table).only(kind),
                None => SubscriptionSpec::table(table),
            };
            match (&query.course_id, query.mine) {
                (Some(course_id), _) if has_course_column(table) => {
                    spec.filter(RowFilter::CourseId(course_id.clone()))
                }
                (_, true) if has_user_column(table) => spec.filter(RowFilter::UserId(user.user_id.clone())),
                _ => spec,
            }
        })
        .collect())
}

async fn subscribe(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<RealtimeQuery>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let specs = build_specs(&query, &user)?;
    let window_ms = clamp_debounce(query.debounce_ms.unwrap_or(state.config.realtime_debounce_ms));
    let label = specs
        .iter()
        .map(|s| s.table.as_str())
        .collect::<Vec<_>>()
        .join(",");

    // A pending notification already covers every later change.
    let (tx, rx) = mpsc::channel::<()>(1);
    let subscription = state.feed.subscribe(specs, Duration::from_millis(window_ms), move || {
        let _ = tx.try_send(());
    });
    tracing::debug!(user_id = %user.user_id, tables = %label, window_ms, "Realtime subscription opened");

    let ready = Event::default().event("ready").data(label.clone());
    let changes = futures::stream::unfold((rx, subscription, label), |(mut rx, subscription, label)| async move {
        rx.recv().await?;
        let event = Event::default().event("change").data(label.clone());
        Some((event, (rx, subscription, label)))
    });

    let stream = futures::stream::once(async move { ready })
        .chain(changes)
        .map(Ok::<_, Infallible>);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
