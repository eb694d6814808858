use axum::{middleware, Router};
use crate::{
    middleware::auth_guard::require_auth,
    state::AppState,
};

mod admin;
mod admin_catalog;
mod auth;
mod calendar;
mod chat;
mod courses;
mod profile;
mod realtime;
mod registrations;

/// Build the full `/api/v1` router.
///
/// Public auth routes are left unprotected; every other route is wrapped in
/// the session-based [`require_auth`] middleware. Admin routers add their own
/// role guard on top.
pub fn all_routes(state: AppState) -> Router<AppState> {
    let auth_mw = middleware::from_fn_with_state(state, require_auth);
    Router::new()
        .merge(auth::router())
        .merge(
            Router::new()
                .merge(profile::router())
                .merge(courses::router())
                .merge(calendar::router())
                .merge(registrations::router())
                .merge(chat::router())
                .merge(realtime::router())
                .merge(admin::router())
                .merge(admin_catalog::router())
                .route_layer(auth_mw),
        )
}
