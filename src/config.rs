use dotenvy::dotenv;
use std::env;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub db_host:          String,
    pub db_port:          u16,
    pub db_name:          String,
    pub db_user:          String,
    pub db_password:      String,

    // Backend
    pub backend_host:     String,
    pub backend_port:     u16,

    // Registration
    pub max_registrations_per_user: usize,

    // Realtime
    pub realtime_debounce_ms: u64,

    // Chat (Gemini)
    pub gemini_api_key:   Option<String>,
    pub gemini_model:     String,
    pub gemini_api_base:  String,
    pub chat_history_limit: i64,

    // Seeded admin
    pub admin_email:      String,
    pub admin_password:   String,

    // App
    pub app_env:          String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

pub const MIN_DEBOUNCE_MS: u64 = 100;
pub const MAX_DEBOUNCE_MS: u64 = 200;

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        fn require(key: &str) -> Result<String, ConfigError> {
            env::var(key).map_err(|_| ConfigError::MissingVar(key.to_string()))
        }

        fn parse_port(key: &str) -> Result<u16, ConfigError> {
            let raw = require(key)?;
            raw.parse::<u16>()
                .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw))
        }

        fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
            match env::var(key) {
                Ok(raw) => raw
                    .parse::<T>()
                    .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw)),
                Err(_) => Ok(default),
            }
        }

        let max_registrations_per_user: usize = parse_or("MAX_REGISTRATIONS_PER_USER", 3)?;
        if max_registrations_per_user == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_REGISTRATIONS_PER_USER".into(),
                "0".into(),
            ));
        }

        Ok(Self {
            db_host:      require("DB_HOST").unwrap_or_else(|_| "db".into()),
            db_port:      parse_port("DB_PORT").unwrap_or(3306),
            db_name:      require("DB_NAME")?,
            db_user:      require("DB_USER")?,
            db_password:  require("DB_PASSWORD")?,

            backend_host: env::var("BACKEND_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            backend_port: parse_port("BACKEND_PORT").unwrap_or(8080),

            max_registrations_per_user,

            realtime_debounce_ms: clamp_debounce(parse_or("REALTIME_DEBOUNCE_MS", 150)?),

            gemini_api_key:  env::var("GEMINI_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            gemini_model:    env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".into()),
            gemini_api_base: env::var("GEMINI_API_BASE")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".into()),
            chat_history_limit: check_history_limit(parse_or("CHAT_HISTORY_LIMIT", 20)?)?,

            admin_email:    env::var("ADMIN_EMAIL").unwrap_or_else(|_| "admin@example.com".into()),
            admin_password: env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "admin".into()),

            app_env:      env::var("APP_ENV").unwrap_or_else(|_| "development".into()),
        })
    }

    pub fn is_development(&self) -> bool {
        self.app_env == "development"
    }
}

/// Subscribers may ask for any window; it is kept inside 100..=200ms.
pub fn clamp_debounce(ms: u64) -> u64 {
    ms.clamp(MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS)
}

/// Becomes a SQL `LIMIT`, so it must not be negative. Zero sends no history.
fn check_history_limit(limit: i64) -> Result<i64, ConfigError> {
    if limit < 0 {
        return Err(ConfigError::InvalidValue("CHAT_HISTORY_LIMIT".into(), limit.to_string()));
    }
    Ok(limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_window_is_clamped() {
        assert_eq!(clamp_debounce(10), 100);
        assert_eq!(clamp_debounce(150), 150);
        assert_eq!(clamp_debounce(5_000), 200);
    }

    #[test]
    fn negative_history_limit_is_rejected() {
        assert_eq!(check_history_limit(20).unwrap(), 20);
        assert_eq!(check_history_limit(0).unwrap(), 0);
        assert!(matches!(
            check_history_limit(-5),
            Err(ConfigError::InvalidValue(key, value)) if key == "CHAT_HISTORY_LIMIT" && value == "-5"
        ));
    }
}
