//! Role-based authorization guard.

use axum::{
    extract::{Extension, Request},
    middleware::Next,
    response::Response,
};

use crate::errors::AppError;
use crate::middleware::auth_guard::AuthUser;
use crate::models::UserRole;

/// Middleware: require the `admin` role. Must run after `require_auth`.
pub async fn require_admin(
    Extension(user): Extension<AuthUser>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if user.role != UserRole::Admin {
        tracing::warn!(user_id = %user.user_id, "Non-admin attempted an admin route");
        return Err(AppError::Forbidden);
    }
    Ok(next.run(req).await)
}
