//! Profile input validation. Runs before any profile write.

use chrono::{Datelike, NaiveDate, Utc};
use serde::Deserialize;
use validator::{Validate, ValidationError};

use crate::{
    errors::{AppError, AppResult},
    models::{EnglishLevel, UserProfile},
};

const MIN_AGE_YEARS: i32 = 14;
const MAX_AGE_YEARS: i32 = 110;

/// Body of `PUT /profile`. Absent or blank personal fields clear the stored value.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProfileInput {
    #[validate(
        length(min = 2, max = 120, message = "Name must be between 2 and 120 characters"),
        custom(function = "validate_name")
    )]
    pub full_name: Option<String>,

    #[validate(custom(function = "validate_phone"))]
    pub phone: Option<String>,

    #[validate(length(min = 5, max = 255, message = "Address must be between 5 and 255 characters"))]
    pub address: Option<String>,

    #[validate(custom(function = "validate_postal_code"))]
    pub postal_code: Option<String>,

    /// `YYYY-MM-DD`
    #[validate(custom(function = "validate_date_of_birth"))]
    pub date_of_birth: Option<String>,

    #[validate(custom(function = "validate_english_level"))]
    pub english_level: Option<String>,
}

impl ProfileInput {
    /// Validate, normalize and convert into the stored profile shape.
    pub fn into_profile(self, user_id: &str) -> AppResult<UserProfile> {
        let input = self.normalized();
        input.validate()?;

        let date_of_birth = input
            .date_of_birth
            .as_deref()
            .map(parse_date)
            .transpose()
            .map_err(|_| AppError::BadRequest("dateOfBirth must be in YYYY-MM-DD format".into()))?;
        let english_level = input
            .english_level
            .as_deref()
            .map(str::parse::<EnglishLevel>)
            .transpose()
            .map_err(AppError::BadRequest)?;

        Ok(UserProfile {
            user_id: user_id.to_owned(),
            full_name: input.full_name,
            phone: input.phone,
            address: input.address,
            postal_code: input.postal_code,
            date_of_birth,
            english_level,
        })
    }

    /// Trim every field and turn blanks into `None` so that clearing a field
    /// is not rejected by the length rules.
    fn normalized(self) -> Self {
        fn clean(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_owned()).filter(|s| !s.is_empty())
        }
        Self {
            full_name:     clean(self.full_name),
            phone:         clean(self.phone),
            address:       clean(self.address),
            postal_code:   clean(self.postal_code).map(|s| s.to_ascii_uppercase()),
            date_of_birth: clean(self.date_of_birth),
            english_level: clean(self.english_level),
        }
    }
}

/// Body of `POST /auth/register` and `POST /auth/login`.
#[derive(Debug, Deserialize, Validate)]
pub struct CredentialsInput {
    #[validate(email(message = "Invalid email address"))]
    pub email:    String,
    #[validate(length(min = 1, max = 256, message = "Password is required"))]
    pub password: String,
    /// Preferred UI language, only read on registration.
    pub language: Option<String>,
}

impl CredentialsInput {
    pub fn normalized_email(&self) -> String {
        self.email.trim().to_lowercase()
    }
}

/// Two or three ASCII letters, optionally followed by a region
/// (`en`, `pl`, `pt-BR`). Returns the primary tag in lower case.
pub fn normalize_language(raw: &str) -> Option<String> {
    let primary = raw.trim().split(['-', '_']).next()?;
    ((2..=3).contains(&primary.len()) && primary.chars().all(|c| c.is_ascii_alphabetic()))
        .then(|| primary.to_ascii_lowercase())
}

/// `HH:MM`, 24-hour clock.
pub fn validate_time_of_day(value: &str) -> Result<(), ValidationError> {
    chrono::NaiveTime::parse_from_str(value, "%H:%M")
        .ok()
        .filter(|_| value.len() == 5)
        .map(|_| ())
        .ok_or_else(|| invalid("time", "Time must be in HH:MM format"))
}

/// Absolute `http` or `https` link.
pub fn validate_link(value: &str) -> Result<(), ValidationError> {
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))
        .unwrap_or_default();
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        return Err(invalid("link", "Link must be an http(s) URL"));
    }
    Ok(())
}

fn parse_date(raw: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
}

fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    ValidationError::new(code).with_message(message.into())
}

fn validate_name(value: &str) -> Result<(), ValidationError> {
    let ok = value
        .chars()
        .all(|c| c.is_alphabetic() || c == ' ' || c == '-' || c == '\'' || c == '.');
    if !ok {
        return Err(invalid("name", "Name may only contain letters, spaces, hyphens and apostrophes"));
    }
    Ok(())
}

/// Optional leading `+`, then 7–15 digits; spaces, dashes and parentheses are ignored.
fn validate_phone(value: &str) -> Result<(), ValidationError> {
    let body = value.strip_prefix('+').unwrap_or(value);
    if !body
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '(' | ')'))
    {
        return Err(invalid("phone", "Phone number contains invalid characters"));
    }
    let digits = body.chars().filter(char::is_ascii_digit).count();
    if !(7..=15).contains(&digits) {
        return Err(invalid("phone", "Phone number must have between 7 and 15 digits"));
    }
    Ok(())
}

/// Letters, digits, one inner space or dash; 3–10 characters.
fn validate_postal_code(value: &str) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if !(3..=10).contains(&len) {
        return Err(invalid("postal_code", "Postal code must be between 3 and 10 characters"));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-') {
        return Err(invalid("postal_code", "Postal code contains invalid characters"));
    }
    if value.starts_with([' ', '-']) || value.ends_with([' ', '-']) {
        return Err(invalid("postal_code", "Postal code contains invalid characters"));
    }
    Ok(())
}

fn validate_date_of_birth(value: &str) -> Result<(), ValidationError> {
    let date = parse_date(value)
        .map_err(|_| invalid("date_of_birth", "Date of birth must be in YYYY-MM-DD format"))?;
    let today = Utc::now().date_naive();
    if date >= today {
        return Err(invalid("date_of_birth", "Date of birth must be in the past"));
    }
    let age = age_on(date, today);
    if age < MIN_AGE_YEARS {
        return Err(invalid("date_of_birth", "You must be at least 14 years old"));
    }
    if age > MAX_AGE_YEARS {
        return Err(invalid("date_of_birth", "Date of birth is not plausible"));
    }
    Ok(())
}

fn validate_english_level(value: &str) -> Result<(), ValidationError> {
    value
        .parse::<EnglishLevel>()
        .map(|_| ())
        .map_err(|_| invalid("english_level", "English level must be one of A1, A2, B1, B2, C1, C2"))
}

fn age_on(birth: NaiveDate, today: NaiveDate) -> i32 {
    let mut age = today.year() - birth.year();
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    age
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_input() -> ProfileInput {
        ProfileInput {
            full_name:     Some("  Maria Skłodowska ".into()),
            phone:         Some("+48 (22) 555-0199".into()),
            address:       Some("ul. Freta 16, Warszawa".into()),
            postal_code:   Some("00-227".into()),
            date_of_birth: Some("1990-11-07".into()),
            english_level: Some("b1".into()),
        }
    }

    #[test]
    fn accepts_a_complete_profile() {
        let profile = valid_input().into_profile("u1").unwrap();
        assert_eq!(profile.full_name.as_deref(), Some("Maria Skłodowska"));
        assert_eq!(profile.english_level, Some(EnglishLevel::B1));
        assert!(profile.is_complete());
    }

    #[test]
    fn blank_fields_clear_instead_of_failing() {
        let input = ProfileInput {
            address: Some("   ".into()),
            ..valid_input()
        };
        let profile = input.into_profile("u1").unwrap();
        assert_eq!(profile.address, None);
        assert!(!profile.is_complete());
    }

    #[test]
    fn rejects_bad_phone_and_postal_code() {
        let input = ProfileInput {
            phone:       Some("12ab".into()),
            postal_code: Some("-12".into()),
            ..valid_input()
        };
        match input.into_profile("u1") {
            Err(AppError::Validation(details)) => {
                assert!(details.contains_key("phone"));
                assert!(details.contains_key("postal_code"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_future_and_malformed_birth_dates() {
        let future = ProfileInput {
            date_of_birth: Some("2999-01-01".into()),
            ..valid_input()
        };
        assert!(matches!(future.into_profile("u1"), Err(AppError::Validation(_))));

        let malformed = ProfileInput {
            date_of_birth: Some("07/11/1990".into()),
            ..valid_input()
        };
        assert!(matches!(malformed.into_profile("u1"), Err(AppError::Validation(_))));
    }

    #[test]
    fn rejects_unknown_english_level() {
        let input = ProfileInput {
            english_level: Some("D9".into()),
            ..valid_input()
        };
        assert!(matches!(input.into_profile("u1"), Err(AppError::Validation(_))));
    }

    #[test]
    fn age_accounts_for_birthday_not_yet_reached() {
        let birth = NaiveDate::from_ymd_opt(2000, 6, 15).unwrap();
        assert_eq!(age_on(birth, NaiveDate::from_ymd_opt(2020, 6, 14).unwrap()), 19);
        assert_eq!(age_on(birth, NaiveDate::from_ymd_opt(2020, 6, 15).unwrap()), 20);
    }

    #[test]
    fn language_tags_are_reduced_to_the_primary_subtag() {
        assert_eq!(normalize_language("pt-BR").as_deref(), Some("pt"));
        assert_eq!(normalize_language(" EN ").as_deref(), Some("en"));
        assert_eq!(normalize_language("english"), None);
        assert_eq!(normalize_language(""), None);
    }

    #[test]
    fn credentials_require_a_plausible_email() {
        let creds = CredentialsInput {
            email:    "not-an-email".into(),
            password: "Secret123".into(),
            language: None,
        };
        assert!(creds.validate().is_err());

        let creds = CredentialsInput { email: " Ada@Example.com ".into(), ..creds };
        assert_eq!(creds.normalized_email(), "ada@example.com");
    }

    #[test]
    fn time_of_day_requires_two_digit_hours() {
        assert!(validate_time_of_day("09:30").is_ok());
        assert!(validate_time_of_day("23:59").is_ok());
        assert!(validate_time_of_day("9:30").is_err());
        assert!(validate_time_of_day("24:00").is_err());
        assert!(validate_time_of_day("noon").is_err());
    }

    #[test]
    fn links_must_be_absolute_http() {
        assert!(validate_link("https://example.org/event").is_ok());
        assert!(validate_link("ftp://example.org").is_err());
        assert!(validate_link("https://").is_err());
        assert!(validate_link("https://exa mple.org").is_err());
    }
}
