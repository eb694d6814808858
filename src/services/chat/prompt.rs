//! System prompt assembly for the course assistant.

use std::collections::HashSet;

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::{
    errors::{AppError, AppResult},
    models::{CalendarEvent, Course, EnglishLevel},
};

pub const COURSES_LIST: &str = "{{COURSES_LIST}}";
pub const USER_ENGLISH_LEVEL: &str = "{{USER_ENGLISH_LEVEL}}";
pub const CONTACTS: &str = "{{CONTACTS}}";
pub const EXTERNAL_LINKS: &str = "{{EXTERNAL_LINKS}}";
pub const UPCOMING_EVENTS: &str = "{{UPCOMING_EVENTS}}";

/// Identifies the inputs a built prompt depends on. A session is rebuilt
/// only when this changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    courses_hash:  String,
    language:      String,
    english_level: Option<EnglishLevel>,
}

impl CacheKey {
    pub fn new(active_courses: &[Course], language: &str, english_level: Option<EnglishLevel>) -> Self {
        Self {
            courses_hash: courses_hash(active_courses),
            language: language.to_owned(),
            english_level,
        }
    }
}

/// Order-independent digest of (id, title, active) over the given courses.
pub fn courses_hash(courses: &[Course]) -> String {
    let mut tuples: Vec<(&str, &str, bool)> = courses
        .iter()
        .map(|c| (c.id.as_str(), c.title.as_str(), c.is_active))
        .collect();
    tuples.sort_unstable();

    let mut hasher = Sha256::new();
    for (id, title, active) in tuples {
        hasher.update(id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(title.as_bytes());
        hasher.update([0x1f, active as u8, 0x1e]);
    }
    format!("{:x}", hasher.finalize())
}

/// Admin-authored blocks. `main` is mandatory.
#[derive(Debug, Clone, Default)]
pub struct Instructions {
    pub main:           String,
    pub contacts:       Option<String>,
    pub external_links: Option<String>,
}

pub struct PromptContext<'a> {
    pub courses:       &'a [Course],
    pub completed:     &'a HashSet<String>,
    pub language:      &'a str,
    pub english_level: Option<EnglishLevel>,
    pub instructions:  &'a Instructions,
    pub events:        &'a [CalendarEvent],
    pub today:         NaiveDate,
}

/// Courses the assistant may recommend: active, not completed by the user,
/// and not above the user's English level (when the level is known).
pub fn recommendable<'c>(
    courses: &'c [Course],
    completed: &HashSet<String>,
    english_level: Option<EnglishLevel>,
) -> Vec<&'c Course> {
    courses
        .iter()
        .filter(|c| c.is_active)
        .filter(|c| !completed.contains(&c.id))
        .filter(|c| english_level.map_or(true, |lvl| lvl.meets(c.min_english_level)))
        .collect()
}

pub fn format_courses(courses: &[&Course], language: &str) -> String {
    if courses.is_empty() {
        return "No courses are currently available.".to_owned();
    }
    courses
        .iter()
        .map(|c| {
            let (title, description) = c.localized(language);
            let mut line = format!("- {title}");
            if let Some(category) = &c.category_name {
                line.push_str(&format!(" [{category}]"));
            }
            line.push_str(&format!(" | Level: {}", c.difficulty.label()));
            if let Some(min) = c.min_english_level {
                line.push_str(&format!(" | Minimum English: {min}"));
            }
            match c.next_session_date {
                Some(date) => line.push_str(&format!(" | Next session: {}", date.format("%Y-%m-%d"))),
                None => line.push_str(" | Next session: not scheduled yet"),
            }
            let description = description.trim();
            if !description.is_empty() {
                line.push_str(&format!("\n  {description}"));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Today-or-later events, ascending by date then time.
pub fn format_events(events: &[CalendarEvent], today: NaiveDate) -> String {
    let mut upcoming: Vec<&CalendarEvent> = events.iter().filter(|e| e.event_date >= today).collect();
    upcoming.sort_by(|a, b| (a.event_date, &a.event_time).cmp(&(b.event_date, &b.event_time)));

    if upcoming.is_empty() {
        return "No upcoming events.".to_owned();
    }
    upcoming
        .iter()
        .map(|e| {
            let mut line = format!("- {}", e.event_date.format("%Y-%m-%d"));
            if let Some(time) = &e.event_time {
                line.push_str(&format!(" {time}"));
            }
            line.push_str(&format!(": {}", e.title));
            if let Some(link) = &e.link {
                line.push_str(&format!(" ({link})"));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Replace every `placeholder`; if the template has none, append the content
/// as its own section instead.
pub fn fill_section(template: &str, placeholder: &str, heading: &str, content: &str) -> String {
    if template.contains(placeholder) {
        template.replace(placeholder, content)
    } else {
        format!("{}\n\n## {heading}\n{content}", template.trim_end())
    }
}

pub fn build_system_prompt(ctx: &PromptContext<'_>) -> AppResult<String> {
    if ctx.instructions.main.trim().is_empty() {
        return Err(AppError::Configuration(
            "Bot instructions are missing; an administrator must configure them".into(),
        ));
    }

    let courses = recommendable(ctx.courses, ctx.completed, ctx.english_level);
    let level = ctx
        .english_level
        .map(|l| l.as_str().to_owned())
        .unwrap_or_else(|| "unknown".to_owned());

    let mut prompt = ctx.instructions.main.clone();
    prompt = fill_section(&prompt, COURSES_LIST, "Available courses", &format_courses(&courses, ctx.language));
    prompt = fill_section(&prompt, USER_ENGLISH_LEVEL, "User English level", &level);
    if let Some(contacts) = ctx.instructions.contacts.as_deref().filter(|s| !s.trim().is_empty()) {
        prompt = fill_section(&prompt, CONTACTS, "Contacts", contacts.trim());
    } else {
        prompt = prompt.replace(CONTACTS, "");
    }
    if let Some(links) = ctx.instructions.external_links.as_deref().filter(|s| !s.trim().is_empty()) {
        prompt = fill_section(&prompt, EXTERNAL_LINKS, "Useful links", links.trim());
    } else {
        prompt = prompt.replace(EXTERNAL_LINKS, "");
    }
    prompt = fill_section(&prompt, UPCOMING_EVENTS, "Upcoming events", &format_events(ctx.events, ctx.today));

    prompt.push_str(&format!("\n\nAlways answer in the user's interface language ({}).", ctx.language));
    Ok(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CourseTranslation, Difficulty};

    fn course(id: &str, title: &str, min: Option<EnglishLevel>) -> Course {
        Course {
            id:                id.into(),
            title:             title.into(),
            category_id:       None,
            category_name:     Some("Trades".into()),
            description:       format!("About {title}"),
            difficulty:        Difficulty::Intermediate,
            min_english_level: min,
            next_session_date: NaiveDate::from_ymd_opt(2026, 11, 3),
            is_active:         true,
            translations:      vec![],
        }
    }

    fn event(title: &str, date: NaiveDate, public: bool) -> CalendarEvent {
        CalendarEvent {
            id:         title.into(),
            title:      title.into(),
            event_date: date,
            event_time: None,
            link:       None,
            icon:       "calendar".into(),
            is_public:  public,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    #[test]
    fn hash_ignores_order_but_not_titles() {
        let a = course("1", "Welding", None);
        let b = course("2", "Plumbing", None);
        assert_eq!(courses_hash(&[a.clone(), b.clone()]), courses_hash(&[b.clone(), a.clone()]));

        let mut renamed = a.clone();
        renamed.title = "Advanced welding".into();
        assert_ne!(courses_hash(&[a, b.clone()]), courses_hash(&[renamed, b]));
    }

    #[test]
    fn cache_key_tracks_language_and_level() {
        let courses = vec![course("1", "Welding", None)];
        let en = CacheKey::new(&courses, "en", Some(EnglishLevel::B1));
        assert_eq!(en, CacheKey::new(&courses, "en", Some(EnglishLevel::B1)));
        assert_ne!(en, CacheKey::new(&courses, "pl", Some(EnglishLevel::B1)));
        assert_ne!(en, CacheKey::new(&courses, "en", Some(EnglishLevel::B2)));
    }

    #[test]
    fn recommendations_skip_completed_and_too_hard_courses() {
        let courses = vec![
            course("1", "Welding", None),
            course("2", "Business English", Some(EnglishLevel::B1)),
            course("3", "Forklift", None),
        ];
        let completed: HashSet<String> = ["3".to_string()].into();

        let ids: Vec<&str> = recommendable(&courses, &completed, Some(EnglishLevel::A2))
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec!["1"]);

        let unknown_level = recommendable(&courses, &completed, None);
        assert_eq!(unknown_level.len(), 2);
    }

    #[test]
    fn placeholders_are_substituted() {
        let courses = vec![course("1", "Welding", None)];
        let instructions = Instructions {
            main:           "Courses:\n{{COURSES_LIST}}\nLevel: {{USER_ENGLISH_LEVEL}}\n{{CONTACTS}}".into(),
            contacts:       Some("Call 555-0100".into()),
            external_links: None,
        };
        let completed = HashSet::new();
        let prompt = build_system_prompt(&PromptContext {
            courses:       &courses,
            completed:     &completed,
            language:      "en",
            english_level: Some(EnglishLevel::B2),
            instructions:  &instructions,
            events:        &[],
            today:         today(),
        })
        .unwrap();

        assert!(prompt.contains("- Welding [Trades] | Level: Intermediate"));
        assert!(prompt.contains("Level: B2"));
        assert!(prompt.contains("Call 555-0100"));
        assert!(!prompt.contains("{{"));
        // No placeholder for events, so a section is appended.
        assert!(prompt.contains("## Upcoming events\nNo upcoming events."));
    }

    #[test]
    fn translations_are_used_for_the_ui_language() {
        let mut c = course("1", "Welding", None);
        c.translations.push(CourseTranslation {
            language:    "pl".into(),
            title:       "Spawanie".into(),
            description: Some("Podstawy".into()),
        });
        let text = format_courses(&[&c], "pl");
        assert!(text.starts_with("- Spawanie"));
        assert!(text.contains("Podstawy"));
    }

    #[test]
    fn events_are_future_only_and_sorted() {
        let events = vec![
            event("Later", NaiveDate::from_ymd_opt(2026, 12, 1).unwrap(), true),
            event("Past", NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(), true),
            event("Today", today(), true),
        ];
        let text = format_events(&events, today());
        assert_eq!(text, "- 2026-10-19: Today\n- 2026-12-01: Later");
    }

    #[test]
    fn empty_main_instructions_are_a_configuration_error() {
        let completed = HashSet::new();
        let instructions = Instructions { main: "   ".into(), ..Default::default() };
        let result = build_system_prompt(&PromptContext {
            courses:       &[],
            completed:     &completed,
            language:      "en",
            english_level: None,
            instructions:  &instructions,
            events:        &[],
            today:         today(),
        });
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }
}
