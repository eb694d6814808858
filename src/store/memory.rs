//! In-memory store for service tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use crate::{
    errors::{AppError, AppResult},
    models::{
        CalendarEvent, ChatMessage, ChatRole, Course, EnglishLevel, InstructionKind, Registration, UserProfile,
    },
};

use super::{ChatContextStore, RegistrationStore};

#[derive(Default)]
struct State {
    courses:       Vec<Course>,
    profiles:      HashMap<String, UserProfile>,
    /// (user_id, course_id, priority)
    registrations: Vec<(String, String, i32)>,
    completions:   HashSet<(String, String)>,
    instructions:  HashMap<InstructionKind, String>,
    events:        Vec<CalendarEvent>,
    messages:      Vec<(String, ChatMessage)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state:             Mutex<State>,
    fail_next_write:   AtomicBool,
    instruction_reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_course(&self, course: Course) {
        self.state().courses.push(course);
    }

    pub fn set_course_title(&self, course_id: &str, title: &str) {
        let mut state = self.state();
        if let Some(c) = state.courses.iter_mut().find(|c| c.id == course_id) {
            c.title = title.to_owned();
        }
    }

    pub fn set_profile(&self, profile: UserProfile) {
        self.state().profiles.insert(profile.user_id.clone(), profile);
    }

    pub fn complete(&self, user_id: &str, course_id: &str) {
        let mut state = self.state();
        state.completions.insert((user_id.to_owned(), course_id.to_owned()));
        state.registrations.retain(|(u, c, _)| !(u == user_id && c == course_id));
    }

    /// Registrant on behalf of another user, bypassing all checks.
    pub fn seed_registration(&self, user_id: &str, course_id: &str, priority: i32) {
        self.state()
            .registrations
            .push((user_id.to_owned(), course_id.to_owned(), priority));
    }

    pub fn set_instruction(&self, kind: InstructionKind, content: &str) {
        self.state().instructions.insert(kind, content.to_owned());
    }

    pub fn add_event(&self, event: CalendarEvent) {
        self.state().events.push(event);
    }

    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    pub fn instruction_reads(&self) -> usize {
        self.instruction_reads.load(Ordering::SeqCst)
    }

    pub fn messages_for(&self, user_id: &str) -> Vec<ChatMessage> {
        self.state()
            .messages
            .iter()
            .filter(|(u, _)| u == user_id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn check_write(&self) -> AppResult<()> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(AppError::Internal(anyhow::anyhow!("simulated write failure")));
        }
        Ok(())
    }

    fn renumber(state: &mut State, user_id: &str) {
        let mut mine: Vec<&mut (String, String, i32)> =
            state.registrations.iter_mut().filter(|(u, _, _)| u == user_id).collect();
        mine.sort_by_key(|reg| reg.2);
        for (idx, reg) in mine.into_iter().enumerate() {
            reg.2 = idx as i32 + 1;
        }
    }
}

#[async_trait]
impl RegistrationStore for MemoryStore {
    async fn registrations_for_user(&self, user_id: &str) -> AppResult<Vec<Registration>> {
        let state = self.state();
        let mut regs: Vec<Registration> = state
            .registrations
            .iter()
            .filter(|(u, _, _)| u == user_id)
            .map(|(_, c, p)| Registration { course_id: c.clone(), priority: *p })
            .collect();
        regs.sort_by_key(|r| r.priority);
        Ok(regs)
    }

    async fn queue_lengths(&self) -> AppResult<HashMap<String, i64>> {
        let mut queues = HashMap::new();
        for (_, c, _) in &self.state().registrations {
            *queues.entry(c.clone()).or_insert(0) += 1;
        }
        Ok(queues)
    }

    async fn completed_course_ids(&self, user_id: &str) -> AppResult<HashSet<String>> {
        self.user_completions(user_id).await
    }

    async fn profile(&self, user_id: &str) -> AppResult<Option<UserProfile>> {
        Ok(self.state().profiles.get(user_id).cloned())
    }

    async fn course(&self, course_id: &str) -> AppResult<Option<Course>> {
        Ok(self.state().courses.iter().find(|c| c.id == course_id).cloned())
    }

    async fn add_registration(&self, user_id: &str, course_id: &str, max_registrations: usize) -> AppResult<()> {
        self.check_write()?;
        let mut state = self.state();
        if state.completions.contains(&(user_id.to_owned(), course_id.to_owned())) {
            return Err(AppError::Eligibility {
                code:    "already_completed",
                message: "You have already completed this course".into(),
            });
        }
        let count = state.registrations.iter().filter(|(u, _, _)| u == user_id).count();
        if state.registrations.iter().any(|(u, c, _)| u == user_id && c == course_id) {
            return Err(AppError::Conflict("Already registered for this course".into()));
        }
        if count >= max_registrations {
            return Err(AppError::Capacity(format!(
                "You can register for at most {max_registrations} courses"
            )));
        }
        state
            .registrations
            .push((user_id.to_owned(), course_id.to_owned(), count as i32 + 1));
        Ok(())
    }

    async fn remove_registration(&self, user_id: &str, course_id: &str) -> AppResult<()> {
        self.check_write()?;
        let mut state = self.state();
        let before = state.registrations.len();
        state.registrations.retain(|(u, c, _)| !(u == user_id && c == course_id));
        if state.registrations.len() == before {
            return Err(AppError::NotFound);
        }
        Self::renumber(&mut state, user_id);
        Ok(())
    }

    async fn set_priorities(&self, user_id: &str, ordered_course_ids: &[String]) -> AppResult<()> {
        self.check_write()?;
        let mut state = self.state();
        for (u, c, p) in state.registrations.iter_mut() {
            if u != user_id {
                continue;
            }
            let pos = ordered_course_ids
                .iter()
                .position(|id| id == c)
                .ok_or_else(|| AppError::Conflict("Registrations changed".into()))?;
            *p = pos as i32 + 1;
        }
        Ok(())
    }
}

#[async_trait]
impl ChatContextStore for MemoryStore {
    async fn active_courses(&self) -> AppResult<Vec<Course>> {
        Ok(self.state().courses.iter().filter(|c| c.is_active).cloned().collect())
    }

    async fn user_completions(&self, user_id: &str) -> AppResult<HashSet<String>> {
        Ok(self
            .state()
            .completions
            .iter()
            .filter(|(u, _)| u == user_id)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn english_level(&self, user_id: &str) -> AppResult<Option<EnglishLevel>> {
        Ok(self.state().profiles.get(user_id).and_then(|p| p.english_level))
    }

    async fn instruction(&self, kind: InstructionKind) -> AppResult<Option<String>> {
        self.instruction_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().instructions.get(&kind).cloned())
    }

    async fn upcoming_public_events(&self, from: NaiveDate) -> AppResult<Vec<CalendarEvent>> {
        let mut events: Vec<CalendarEvent> = self
            .state()
            .events
            .iter()
            .filter(|e| e.is_public && e.event_date >= from)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.event_date);
        Ok(events)
    }

    async fn recent_messages(&self, user_id: &str, limit: i64) -> AppResult<Vec<ChatMessage>> {
        let mine = self.messages_for(user_id);
        let skip = mine.len().saturating_sub(limit.max(0) as usize);
        Ok(mine.into_iter().skip(skip).collect())
    }

    async fn append_message(
        &self,
        user_id: &str,
        role: ChatRole,
        content: &str,
        is_error: bool,
        interrupted: bool,
    ) -> AppResult<ChatMessage> {
        let mut state = self.state();
        let message = ChatMessage {
            id: format!("m{}", state.messages.len() + 1),
            role,
            content: content.to_owned(),
            created_at: Utc::now().naive_utc(),
            is_error,
            interrupted,
        };
        state.messages.push((user_id.to_owned(), message.clone()));
        Ok(message)
    }
}
