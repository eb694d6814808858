//! `/chat` — course assistant.
//!
//! `POST   /chat`         — send a message; the reply streams back as SSE
//!                          events `chunk`, then `done` or `error`
//! `GET    /chat/history` — stored conversation, oldest first
//! `DELETE /chat/history` — forget the conversation

use std::convert::Infallible;

use axum::{
    extract::{Extension, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    errors::{AppError, AppResult},
    middleware::auth_guard::AuthUser,
    models::ChatMessage,
    services::chat::{validate_message, ChatEvent},
    state::AppState,
    store::ChatContextStore,
    validation::normalize_language,
};

const HISTORY_PAGE_MAX: i64 = 200;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat",         post(send_message))
        .route("/chat/history", get(history).delete(clear_history))
}

#[derive(Deserialize)]
struct ChatBody {
    message: String,
    lang:    Option<String>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<ChatBody>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let language = body
        .lang
        .as_deref()
        .and_then(normalize_language)
        .unwrap_or_else(|| user.language.clone());

    // Input and configuration problems are answered as plain HTTP errors
    // before the event stream opens.
    let message = validate_message(&body.message)?.to_owned();
    if !state.chat.is_configured() {
        return Err(AppError::Configuration("GEMINI_API_KEY is not configured".into()));
    }
    state
        .chat
        .prepare(state.store.as_ref(), &user.user_id, &language, false)
        .await?;

    let (tx, rx) = mpsc::channel::<ChatEvent>(32);
    let cancel = CancellationToken::new();
    // Dropped together with the response stream when the client goes away.
    let guard = cancel.clone().drop_guard();

    let chat = state.chat.clone();
    let store = state.store.clone();
    let user_id = user.user_id.clone();
    tokio::spawn(async move {
        let errors = tx.clone();
        let result = chat
            .respond(store.as_ref(), &user_id, &language, &message, cancel, tx)
            .await;
        if let Err(err) = result {
            tracing::warn!(%user_id, error = %err, "Chat request failed");
            let _ = errors
                .send(ChatEvent::Error { code: err.code().into(), message: err.public_message() })
                .await;
        }
    });

    let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        let sse = Event::default()
            .event(event.name())
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().event("error"));
        Some((Ok::<_, Infallible>(sse), (rx, guard)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<ChatMessage>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, HISTORY_PAGE_MAX);
    let messages = state.store.recent_messages(&user.user_id, limit).await?;
    Ok(Json(messages))
}

async fn clear_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<serde_json::Value>> {
    let deleted = state.store.clear_chat_history(&user.user_id).await?;
    tracing::info!(user_id = %user.user_id, deleted, "Chat history cleared");
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
