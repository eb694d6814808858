//! Data access seams used by the registration and chat services.
//!
//! [`MySqlStore`] is the production implementation. Tests use the in-memory
//! store from `memory`.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::{
    errors::AppResult,
    models::{CalendarEvent, ChatMessage, ChatRole, Course, EnglishLevel, InstructionKind, Registration, UserProfile},
};

pub mod mysql;

#[cfg(test)]
pub mod memory;

pub use mysql::MySqlStore;

#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// The user's registrations ordered by priority (1 first).
    async fn registrations_for_user(&self, user_id: &str) -> AppResult<Vec<Registration>>;

    /// Number of registrants per course. Courses without registrants are absent.
    async fn queue_lengths(&self) -> AppResult<HashMap<String, i64>>;

    async fn completed_course_ids(&self, user_id: &str) -> AppResult<HashSet<String>>;

    async fn profile(&self, user_id: &str) -> AppResult<Option<UserProfile>>;

    async fn course(&self, course_id: &str) -> AppResult<Option<Course>>;

    /// Append a registration at the lowest priority. The store re-checks the
    /// cap and the completion rule atomically, so concurrent writers cannot
    /// break either invariant.
    async fn add_registration(&self, user_id: &str, course_id: &str, max_registrations: usize) -> AppResult<()>;

    /// Remove a registration and compact the remaining priorities to `1..N`.
    async fn remove_registration(&self, user_id: &str, course_id: &str) -> AppResult<()>;

    /// Renumber the user's registrations following `ordered_course_ids`, which
    /// must name exactly the user's current registrations.
    async fn set_priorities(&self, user_id: &str, ordered_course_ids: &[String]) -> AppResult<()>;
}

#[async_trait]
pub trait ChatContextStore: Send + Sync {
    /// Active courses with category name, translations and the next
    /// scheduled session date.
    async fn active_courses(&self) -> AppResult<Vec<Course>>;

    async fn user_completions(&self, user_id: &str) -> AppResult<HashSet<String>>;

    async fn english_level(&self, user_id: &str) -> AppResult<Option<EnglishLevel>>;

    async fn instruction(&self, kind: InstructionKind) -> AppResult<Option<String>>;

    /// Public events dated `from` or later, ascending.
    async fn upcoming_public_events(&self, from: NaiveDate) -> AppResult<Vec<CalendarEvent>>;

    /// The most recent `limit` messages, oldest first.
    async fn recent_messages(&self, user_id: &str, limit: i64) -> AppResult<Vec<ChatMessage>>;

    async fn append_message(
        &self,
        user_id: &str,
        role: ChatRole,
        content: &str,
        is_error: bool,
        interrupted: bool,
    ) -> AppResult<ChatMessage>;
}
