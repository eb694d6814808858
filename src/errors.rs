//! Application error type shared by handlers, services and stores.
//!
//! Every variant renders as `{ "error": <code>, "message": <text> }`. The
//! `error` code is stable and doubles as the client's localization key.

use std::collections::HashMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Validation failed")]
    Validation(HashMap<String, Vec<String>>),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    /// Registration cap reached.
    #[error("{0}")]
    Capacity(String),

    /// Eligibility failure: `code` is `already_completed` or `profile_incomplete`.
    #[error("{message}")]
    Eligibility { code: &'static str, message: String },

    /// Operator-facing misconfiguration (missing API key, missing bot instructions).
    #[error("{0}")]
    Configuration(String),

    /// Upstream (LLM) failure after retries were exhausted.
    #[error("{0}")]
    Upstream(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_)               => "bad_request",
            AppError::Validation(_)               => "validation",
            AppError::Unauthorized                => "unauthorized",
            AppError::Forbidden                   => "forbidden",
            AppError::NotFound                    => "not_found",
            AppError::Conflict(_)                 => "conflict",
            AppError::Capacity(_)                 => "capacity",
            AppError::Eligibility { code, .. }    => code,
            AppError::Configuration(_)            => "configuration",
            AppError::Upstream(_)                 => "upstream",
            AppError::Internal(_)                 => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized                           => StatusCode::UNAUTHORIZED,
            AppError::Forbidden | AppError::Eligibility { .. } => StatusCode::FORBIDDEN,
            AppError::NotFound                               => StatusCode::NOT_FOUND,
            AppError::Conflict(_) | AppError::Capacity(_)    => StatusCode::CONFLICT,
            AppError::Configuration(_)                       => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream(_)                            => StatusCode::BAD_GATEWAY,
            AppError::Internal(_)                            => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to end users. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Internal(_) => "Something went wrong. Please try again.".to_owned(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            AppError::Internal(err) => tracing::error!(error = ?err, "Internal error"),
            AppError::Configuration(msg) => tracing::error!(%msg, "Configuration error"),
            AppError::Upstream(msg) => tracing::warn!(%msg, "Upstream error"),
            _ => {}
        }

        let mut body = json!({
            "error":   self.code(),
            "message": self.public_message(),
        });
        if let AppError::Validation(details) = &self {
            body["details"] = json!(details);
        }

        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => AppError::NotFound,
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict("Resource already exists".into())
            }
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut map = HashMap::new();
        for (field, field_errors) in errors.field_errors() {
            let messages = field_errors
                .iter()
                .map(|e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("Invalid value for field '{field}'"))
                })
                .collect();
            map.insert(field.to_string(), messages);
        }
        AppError::Validation(map)
    }
}
