use std::{net::SocketAddr, sync::Arc};

use axum::Router;
use tokio::net::TcpListener;
use tower_cookies::CookieManagerLayer;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod auth;
mod config;
mod db;
mod errors;
mod middleware;
mod models;
mod routes;
mod services;
mod state;
mod store;
mod validation;

use services::{
    chat::{gemini::{ChatModel, GeminiClient}, ChatService},
    realtime::ChangeFeed,
};
use state::AppState;
use store::MySqlStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ───────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── Config ────────────────────────────────────────────────
    let config = config::Config::from_env()?;
    tracing::info!(
        env = %config.app_env,
        max_registrations = config.max_registrations_per_user,
        debounce_ms = config.realtime_debounce_ms,
        "Starting course enrollment backend"
    );

    // ── Database ──────────────────────────────────────────────
    let pool = db::connect(&config).await?;
    db::run_migrations(&pool).await?;

    // ── Seed admin account ────────────────────────────────────
    auth::seed::seed_accounts(&pool, &config).await?;

    // ── Services ──────────────────────────────────────────────
    let feed  = ChangeFeed::new();
    let store = Arc::new(MySqlStore::new(pool.clone(), feed.clone()));

    let model: Option<Arc<dyn ChatModel>> = match GeminiClient::from_config(&config) {
        Some(client) => {
            tracing::info!(model = %config.gemini_model, "Chat assistant enabled");
            Some(Arc::new(client))
        }
        None => {
            tracing::warn!("GEMINI_API_KEY is not set; chat requests will fail with a configuration error");
            None
        }
    };
    let chat = Arc::new(ChatService::new(model, config.chat_history_limit));

    let addr: SocketAddr = format!("{}:{}", config.backend_host, config.backend_port).parse()?;

    let app_state = AppState { pool, config, store, feed, chat };

    // ── Router ────────────────────────────────────────────────
    let app = Router::new()
        .nest("/api/v1", routes::all_routes(app_state.clone()))
        .layer(CookieManagerLayer::new())   // must come before state
        .layer(CorsLayer::permissive())     // tighten in production
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);
    tracing::info!(%addr, "Listening");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
