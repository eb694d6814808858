//! Domain types shared by the store, the services and the routes.

use std::{fmt, str::FromStr};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

// ── Users ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::User  => "user",
        }
    }

    /// Unknown role strings degrade to the least-privileged role.
    pub fn from_db(raw: &str) -> Self {
        if raw == "admin" { UserRole::Admin } else { UserRole::User }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── English level ────────────────────────────────────────────

/// CEFR ladder. Ordering follows the ladder, so `A2 < B1`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EnglishLevel {
    A1,
    A2,
    B1,
    B2,
    C1,
    C2,
}

impl EnglishLevel {
    pub const ALL: [EnglishLevel; 6] = [
        EnglishLevel::A1,
        EnglishLevel::A2,
        EnglishLevel::B1,
        EnglishLevel::B2,
        EnglishLevel::C1,
        EnglishLevel::C2,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EnglishLevel::A1 => "A1",
            EnglishLevel::A2 => "A2",
            EnglishLevel::B1 => "B1",
            EnglishLevel::B2 => "B2",
            EnglishLevel::C1 => "C1",
            EnglishLevel::C2 => "C2",
        }
    }

    /// Whether a user at `self` meets a course's minimum level.
    /// Courses without a minimum are open to everybody.
    pub fn meets(self, minimum: Option<EnglishLevel>) -> bool {
        minimum.map_or(true, |m| self >= m)
    }
}

impl fmt::Display for EnglishLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnglishLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        EnglishLevel::ALL
            .into_iter()
            .find(|l| l.as_str() == upper)
            .ok_or_else(|| format!("Unknown English level '{s}'"))
    }
}

/// Lenient parse for nullable DB columns: blanks and garbage become `None`.
pub fn parse_level(raw: Option<&str>) -> Option<EnglishLevel> {
    raw.and_then(|s| s.parse().ok())
}

// ── Courses ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Beginner     => "beginner",
            Difficulty::Intermediate => "intermediate",
            Difficulty::Advanced     => "advanced",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Difficulty::Beginner     => "Beginner",
            Difficulty::Intermediate => "Intermediate",
            Difficulty::Advanced     => "Advanced",
        }
    }
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beginner"     => Ok(Difficulty::Beginner),
            "intermediate" => Ok(Difficulty::Intermediate),
            "advanced"     => Ok(Difficulty::Advanced),
            other          => Err(format!("Unknown difficulty '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CourseTranslation {
    pub language:    String,
    pub title:       String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id:                String,
    pub title:             String,
    pub category_id:       Option<String>,
    pub category_name:     Option<String>,
    pub description:       String,
    pub difficulty:        Difficulty,
    pub min_english_level: Option<EnglishLevel>,
    pub next_session_date: Option<NaiveDate>,
    pub is_active:         bool,
    #[serde(default)]
    pub translations:      Vec<CourseTranslation>,
}

impl Course {
    /// Title and description in `language`, falling back to the base text.
    pub fn localized(&self, language: &str) -> (&str, &str) {
        match self.translations.iter().find(|t| t.language == language) {
            Some(t) => (
                t.title.as_str(),
                t.description.as_deref().unwrap_or(&self.description),
            ),
            None => (self.title.as_str(), self.description.as_str()),
        }
    }
}

// ── Course sessions ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Archived,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active   => "active",
            SessionStatus::Archived => "archived",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        if raw == "archived" { SessionStatus::Archived } else { SessionStatus::Active }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseSession {
    pub id:                 String,
    pub course_id:          String,
    pub session_date:       NaiveDate,
    pub capacity:           i32,
    pub current_enrollment: i32,
    pub status:             SessionStatus,
}

// ── Registrations / completions ──────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq, Eq, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub course_id: String,
    pub priority:  i32,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CourseCompletion {
    pub user_id:      String,
    pub course_id:    String,
    pub completed_at: NaiveDateTime,
    pub marked_by:    Option<String>,
}

// ── Profiles ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id:       String,
    pub full_name:     Option<String>,
    pub phone:         Option<String>,
    pub address:       Option<String>,
    pub postal_code:   Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub english_level: Option<EnglishLevel>,
}

impl UserProfile {
    /// A profile is complete when every optional personal field is filled in.
    pub fn is_complete(&self) -> bool {
        fn filled(v: &Option<String>) -> bool {
            v.as_deref().is_some_and(|s| !s.trim().is_empty())
        }
        filled(&self.full_name)
            && filled(&self.phone)
            && filled(&self.address)
            && filled(&self.postal_code)
            && self.date_of_birth.is_some()
    }
}

// ── Categories / calendar ────────────────────────────────────

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CourseCategory {
    pub id:           String,
    pub display_name: String,
    pub icon:         String,
    pub color:        String,
    pub sort_order:   i32,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id:         String,
    pub title:      String,
    pub event_date: NaiveDate,
    pub event_time: Option<String>, // "HH:MM"
    pub link:       Option<String>,
    pub icon:       String,
    pub is_public:  bool,
}

// ── Chat ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::User      => "user",
            ChatRole::Assistant => "assistant",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        if raw == "assistant" { ChatRole::Assistant } else { ChatRole::User }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id:          String,
    pub role:        ChatRole,
    pub content:     String,
    pub created_at:  NaiveDateTime,
    pub is_error:    bool,
    pub interrupted: bool,
}

/// Admin-authored template blocks assembled into the system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstructionKind {
    Main,
    Contacts,
    ExternalLinks,
}

impl InstructionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InstructionKind::Main          => "main",
            InstructionKind::Contacts      => "contacts",
            InstructionKind::ExternalLinks => "external_links",
        }
    }
}

impl FromStr for InstructionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main"           => Ok(InstructionKind::Main),
            "contacts"       => Ok(InstructionKind::Contacts),
            "external_links" => Ok(InstructionKind::ExternalLinks),
            other            => Err(format!("Unknown instruction kind '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_ladder_orders_levels() {
        assert!(EnglishLevel::A2 < EnglishLevel::B1);
        assert!(EnglishLevel::A2.meets(None));
        assert!(!EnglishLevel::A2.meets(Some(EnglishLevel::B1)));
        assert!(EnglishLevel::C1.meets(Some(EnglishLevel::B2)));
        assert_eq!("b2".parse::<EnglishLevel>().unwrap(), EnglishLevel::B2);
        assert_eq!(parse_level(Some("")), None);
    }

    #[test]
    fn profile_completeness_requires_every_field() {
        let mut profile = UserProfile {
            user_id:       "u1".into(),
            full_name:     Some("Ada Lovelace".into()),
            phone:         Some("+44 20 7946 0958".into()),
            address:       Some("12 St James's Square".into()),
            postal_code:   Some("SW1Y 4LB".into()),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 12, 10),
            english_level: None,
        };
        assert!(profile.is_complete());

        profile.address = Some("   ".into());
        assert!(!profile.is_complete());
    }

    #[test]
    fn localized_falls_back_to_base_text() {
        let course = Course {
            id:                "c1".into(),
            title:             "Welding".into(),
            category_id:       None,
            category_name:     None,
            description:       "Basics".into(),
            difficulty:        Difficulty::Beginner,
            min_english_level: None,
            next_session_date: None,
            is_active:         true,
            translations:      vec![CourseTranslation {
                language:    "pl".into(),
                title:       "Spawanie".into(),
                description: None,
            }],
        };
        assert_eq!(course.localized("pl"), ("Spawanie", "Basics"));
        assert_eq!(course.localized("de"), ("Welding", "Basics"));
    }
}
