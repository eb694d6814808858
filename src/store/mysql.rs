//! MySQL-backed store. Every write publishes a change on the feed.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::{
    db::Db,
    errors::{AppError, AppResult},
    models::{
        parse_level, CalendarEvent, ChatMessage, ChatRole, Course, CourseTranslation, Difficulty,
        EnglishLevel, InstructionKind, Registration, UserProfile,
    },
    services::realtime::{ChangeEvent, ChangeFeed, ChangeKind, Table},
};

use super::{ChatContextStore, RegistrationStore};

#[derive(Clone)]
pub struct MySqlStore {
    pool: Db,
    feed: ChangeFeed,
}

// ── Row types ────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct CourseRow {
    id:                String,
    title:             String,
    category_id:       Option<String>,
    category_name:     Option<String>,
    description:       String,
    difficulty:        String,
    min_english_level: Option<String>,
    next_session_date: Option<NaiveDate>,
    is_active:         bool,
}

#[derive(sqlx::FromRow)]
struct TranslationRow {
    course_id:   String,
    language:    String,
    title:       String,
    description: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    user_id:       String,
    full_name:     Option<String>,
    phone:         Option<String>,
    address:       Option<String>,
    postal_code:   Option<String>,
    date_of_birth: Option<NaiveDate>,
    english_level: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ChatMessageRow {
    id:          String,
    role:        String,
    content:     String,
    created_at:  NaiveDateTime,
    is_error:    bool,
    interrupted: bool,
}

/// Next session: the earliest upcoming active session, else the date set on the course.
const COURSE_SELECT: &str =
    "SELECT c.id, c.title, c.category_id, cat.display_name AS category_name,
            c.description, c.difficulty, c.min_english_level,
            COALESCE(
                (SELECT MIN(s.session_date) FROM course_sessions s
                 WHERE s.course_id = c.id AND s.status = 'active' AND s.session_date >= CURDATE()),
                c.next_session_date
            ) AS next_session_date,
            c.is_active
     FROM courses c
     LEFT JOIN course_categories cat ON cat.id = c.category_id";

fn course_from_row(row: CourseRow, translations: Vec<CourseTranslation>) -> Course {
    Course {
        difficulty:        row.difficulty.parse().unwrap_or(Difficulty::Beginner),
        min_english_level: parse_level(row.min_english_level.as_deref()),
        id:                row.id,
        title:             row.title,
        category_id:       row.category_id,
        category_name:     row.category_name,
        description:       row.description,
        next_session_date: row.next_session_date,
        is_active:         row.is_active,
        translations,
    }
}

impl MySqlStore {
    pub fn new(pool: Db, feed: ChangeFeed) -> Self {
        Self { pool, feed }
    }

    // ── Courses ──────────────────────────────────────────────

    pub async fn courses(&self, include_inactive: bool) -> AppResult<Vec<Course>> {
        let sql = if include_inactive {
            format!("{COURSE_SELECT} ORDER BY c.is_active DESC, c.title")
        } else {
            format!("{COURSE_SELECT} WHERE c.is_active = 1 ORDER BY c.title")
        };
        let rows = sqlx::query_as::<_, CourseRow>(&sql).fetch_all(&self.pool).await?;

        let mut by_course: HashMap<String, Vec<CourseTranslation>> = HashMap::new();
        let translations = sqlx::query_as::<_, TranslationRow>(
            "SELECT course_id, language, title, description FROM course_translations ORDER BY language",
        )
        .fetch_all(&self.pool)
        .await?;
        for t in translations {
            by_course.entry(t.course_id).or_default().push(CourseTranslation {
                language:    t.language,
                title:       t.title,
                description: t.description,
            });
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let translations = by_course.remove(&row.id).unwrap_or_default();
                course_from_row(row, translations)
            })
            .collect())
    }

    pub async fn course_by_id(&self, course_id: &str) -> AppResult<Option<Course>> {
        let sql = format!("{COURSE_SELECT} WHERE c.id = ?");
        let Some(row) = sqlx::query_as::<_, CourseRow>(&sql)
            .bind(course_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let translations = sqlx::query_as::<_, TranslationRow>(
            "SELECT course_id, language, title, description
             FROM course_translations WHERE course_id = ? ORDER BY language",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|t| CourseTranslation { language: t.language, title: t.title, description: t.description })
        .collect();

        Ok(Some(course_from_row(row, translations)))
    }

    // ── Profiles ─────────────────────────────────────────────

    pub async fn save_profile(&self, profile: &UserProfile) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO user_profiles
                (user_id, full_name, phone, address, postal_code, date_of_birth, english_level)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                full_name = VALUES(full_name),
                phone = VALUES(phone),
                address = VALUES(address),
                postal_code = VALUES(postal_code),
                date_of_birth = VALUES(date_of_birth),
                english_level = VALUES(english_level)",
        )
        .bind(&profile.user_id)
        .bind(&profile.full_name)
        .bind(&profile.phone)
        .bind(&profile.address)
        .bind(&profile.postal_code)
        .bind(profile.date_of_birth)
        .bind(profile.english_level.map(EnglishLevel::as_str))
        .execute(&self.pool)
        .await?;

        self.feed.publish(ChangeEvent::new(Table::UserProfiles, ChangeKind::Update).user(&profile.user_id));
        Ok(())
    }

    // ── Chat history ─────────────────────────────────────────

    pub async fn clear_chat_history(&self, user_id: &str) -> AppResult<u64> {
        let affected = sqlx::query("DELETE FROM chat_messages WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    // ── Completions ──────────────────────────────────────────

    /// Record that `user_id` completed `course_id`. Any registration for the
    /// pair is removed in the same transaction. Returns whether one existed.
    pub async fn mark_completion(&self, user_id: &str, course_id: &str, marked_by: &str) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        Self::lock_user(&mut tx, user_id).await?;

        sqlx::query(
            "INSERT INTO course_completions (id, user_id, course_id, completed_at, marked_by)
             VALUES (?, ?, ?, UTC_TIMESTAMP(), ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(course_id)
        .bind(marked_by)
        .execute(&mut *tx)
        .await
        .map_err(|e| match AppError::from(e) {
            AppError::Conflict(_) => AppError::Conflict("Completion is already recorded".into()),
            other => other,
        })?;

        let removed = sqlx::query("DELETE FROM registrations WHERE user_id = ? AND course_id = ?")
            .bind(user_id)
            .bind(course_id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;
        if removed {
            Self::compact_priorities(&mut tx, user_id).await?;
        }
        tx.commit().await?;

        self.feed.publish(
            ChangeEvent::new(Table::CourseCompletions, ChangeKind::Insert)
                .user(user_id)
                .course(course_id),
        );
        if removed {
            self.feed.publish(
                ChangeEvent::new(Table::Registrations, ChangeKind::Delete)
                    .user(user_id)
                    .course(course_id),
            );
        }
        Ok(removed)
    }

    pub async fn unmark_completion(&self, user_id: &str, course_id: &str) -> AppResult<()> {
        let affected = sqlx::query("DELETE FROM course_completions WHERE user_id = ? AND course_id = ?")
            .bind(user_id)
            .bind(course_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(AppError::NotFound);
        }

        self.feed.publish(
            ChangeEvent::new(Table::CourseCompletions, ChangeKind::Delete)
                .user(user_id)
                .course(course_id),
        );
        Ok(())
    }

    // ── Internal ─────────────────────────────────────────────

    async fn lock_user(tx: &mut sqlx::Transaction<'_, sqlx::MySql>, user_id: &str) -> AppResult<()> {
        // Serializes concurrent registration writes for one user (e.g. two tabs).
        sqlx::query_scalar::<_, String>("SELECT id FROM users WHERE id = ? FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(AppError::NotFound)?;
        Ok(())
    }

    /// Renumber the user's registrations to `1..N`, keeping their order.
    async fn compact_priorities(tx: &mut sqlx::Transaction<'_, sqlx::MySql>, user_id: &str) -> AppResult<()> {
        let remaining: Vec<String> = sqlx::query_scalar(
            "SELECT course_id FROM registrations WHERE user_id = ? ORDER BY priority, created_at",
        )
        .bind(user_id)
        .fetch_all(&mut **tx)
        .await?;
        for (idx, cid) in remaining.iter().enumerate() {
            sqlx::query("UPDATE registrations SET priority = ? WHERE user_id = ? AND course_id = ?")
                .bind(idx as i32 + 1)
                .bind(user_id)
                .bind(cid)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    async fn completed_ids(&self, user_id: &str) -> AppResult<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT course_id FROM course_completions WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }
}

#[async_trait]
impl RegistrationStore for MySqlStore {
    async fn registrations_for_user(&self, user_id: &str) -> AppResult<Vec<Registration>> {
        let rows = sqlx::query_as::<_, Registration>(
            "SELECT course_id, priority FROM registrations
             WHERE user_id = ?
             ORDER BY priority, created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn queue_lengths(&self) -> AppResult<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT course_id, COUNT(*) AS queue_length FROM registrations GROUP BY course_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn completed_course_ids(&self, user_id: &str) -> AppResult<HashSet<String>> {
        self.completed_ids(user_id).await
    }

    async fn profile(&self, user_id: &str) -> AppResult<Option<UserProfile>> {
        let row = sqlx::query_as::<_, ProfileRow>(
            "SELECT user_id, full_name, phone, address, postal_code, date_of_birth, english_level
             FROM user_profiles WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| UserProfile {
            english_level: parse_level(r.english_level.as_deref()),
            user_id:       r.user_id,
            full_name:     r.full_name,
            phone:         r.phone,
            address:       r.address,
            postal_code:   r.postal_code,
            date_of_birth: r.date_of_birth,
        }))
    }

    async fn course(&self, course_id: &str) -> AppResult<Option<Course>> {
        self.course_by_id(course_id).await
    }

    async fn add_registration(&self, user_id: &str, course_id: &str, max_registrations: usize) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_user(&mut tx, user_id).await?;

        let completed: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM course_completions WHERE user_id = ? AND course_id = ?)",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_one(&mut *tx)
        .await?;
        if completed {
            return Err(AppError::Eligibility {
                code:    "already_completed",
                message: "You have already completed this course".into(),
            });
        }

        let registered: Vec<String> = sqlx::query_scalar("SELECT course_id FROM registrations WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await?;
        if registered.iter().any(|c| c == course_id) {
            return Err(AppError::Conflict("Already registered for this course".into()));
        }
        if registered.len() >= max_registrations {
            return Err(AppError::Capacity(format!(
                "You can register for at most {max_registrations} courses"
            )));
        }

        sqlx::query("INSERT INTO registrations (id, user_id, course_id, priority) VALUES (?, ?, ?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(user_id)
            .bind(course_id)
            .bind(registered.len() as i32 + 1)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.feed.publish(
            ChangeEvent::new(Table::Registrations, ChangeKind::Insert)
                .user(user_id)
                .course(course_id),
        );
        Ok(())
    }

    async fn remove_registration(&self, user_id: &str, course_id: &str) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_user(&mut tx, user_id).await?;

        let affected = sqlx::query("DELETE FROM registrations WHERE user_id = ? AND course_id = ?")
            .bind(user_id)
            .bind(course_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(AppError::NotFound);
        }

        Self::compact_priorities(&mut tx, user_id).await?;
        tx.commit().await?;

        self.feed.publish(
            ChangeEvent::new(Table::Registrations, ChangeKind::Delete)
                .user(user_id)
                .course(course_id),
        );
        Ok(())
    }

    async fn set_priorities(&self, user_id: &str, ordered_course_ids: &[String]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_user(&mut tx, user_id).await?;

        let current: HashSet<String> = sqlx::query_scalar::<_, String>(
            "SELECT course_id FROM registrations WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .collect();
        let requested: HashSet<&String> = ordered_course_ids.iter().collect();
        if current.len() != ordered_course_ids.len()
            || requested.len() != ordered_course_ids.len()
            || !ordered_course_ids.iter().all(|c| current.contains(c))
        {
            return Err(AppError::Conflict(
                "Your registrations changed in the meantime. Please refresh and try again.".into(),
            ));
        }

        for (idx, cid) in ordered_course_ids.iter().enumerate() {
            sqlx::query("UPDATE registrations SET priority = ? WHERE user_id = ? AND course_id = ?")
                .bind(idx as i32 + 1)
                .bind(user_id)
                .bind(cid)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        self.feed.publish(ChangeEvent::new(Table::Registrations, ChangeKind::Update).user(user_id));
        Ok(())
    }
}

#[async_trait]
impl ChatContextStore for MySqlStore {
    async fn active_courses(&self) -> AppResult<Vec<Course>> {
        self.courses(false).await
    }

    async fn user_completions(&self, user_id: &str) -> AppResult<HashSet<String>> {
        self.completed_ids(user_id).await
    }

    async fn english_level(&self, user_id: &str) -> AppResult<Option<EnglishLevel>> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT english_level FROM user_profiles WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(parse_level(raw.flatten().as_deref()))
    }

    async fn instruction(&self, kind: InstructionKind) -> AppResult<Option<String>> {
        let content: Option<String> = sqlx::query_scalar("SELECT content FROM bot_instructions WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(content)
    }

    async fn upcoming_public_events(&self, from: NaiveDate) -> AppResult<Vec<CalendarEvent>> {
        let rows = sqlx::query_as::<_, CalendarEvent>(
            "SELECT id, title, event_date, event_time, link, icon, is_public
             FROM calendar_events
             WHERE is_public = 1 AND event_date >= ?
             ORDER BY event_date, event_time",
        )
        .bind(from)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn recent_messages(&self, user_id: &str, limit: i64) -> AppResult<Vec<ChatMessage>> {
        let mut rows = sqlx::query_as::<_, ChatMessageRow>(
            "SELECT id, role, content, created_at, is_error, interrupted
             FROM chat_messages
             WHERE user_id = ?
             ORDER BY created_at DESC
             LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();

        Ok(rows
            .into_iter()
            .map(|r| ChatMessage {
                role:        ChatRole::from_db(&r.role),
                id:          r.id,
                content:     r.content,
                created_at:  r.created_at,
                is_error:    r.is_error,
                interrupted: r.interrupted,
            })
            .collect())
    }

    async fn append_message(
        &self,
        user_id: &str,
        role: ChatRole,
        content: &str,
        is_error: bool,
        interrupted: bool,
    ) -> AppResult<ChatMessage> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().naive_utc();
        sqlx::query(
            "INSERT INTO chat_messages (id, user_id, role, content, is_error, interrupted, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(content)
        .bind(is_error)
        .bind(interrupted)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(ChatMessage {
            id,
            role,
            content: content.to_owned(),
            created_at,
            is_error,
            interrupted,
        })
    }
}
