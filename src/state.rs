//! Shared application state — injected into every handler via `axum::extract::State`.

use std::sync::Arc;

use crate::{
    config::Config,
    db::Db,
    services::{chat::ChatService, realtime::ChangeFeed},
    store::MySqlStore,
};

/// Application-wide state passed via axum `State<AppState>`.
///
/// Everything here is cheap to clone: the pool and the feed are handles,
/// and the store and chat service sit behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub pool:   Db,
    pub config: Config,
    pub store:  Arc<MySqlStore>,
    pub feed:   ChangeFeed,
    pub chat:   Arc<ChatService>,
}
