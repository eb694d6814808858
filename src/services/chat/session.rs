//! Per-user chat sessions.
//!
//! A session holds the system prompt built for one [`CacheKey`]. It is
//! rebuilt only when the key changes or when it is explicitly invalidated.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use super::prompt::CacheKey;

#[derive(Debug, Clone)]
pub struct ChatSession {
    key:           CacheKey,
    system_prompt: String,
}

impl ChatSession {
    pub fn new(key: CacheKey, system_prompt: String) -> Self {
        Self { key, system_prompt }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }
}

#[derive(Default)]
pub struct ChatSessions {
    inner: Mutex<HashMap<String, ChatSession>>,
}

impl ChatSessions {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock leaves the map itself consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ChatSession>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True on cold start or when `key` differs from the installed session's.
    /// Has no side effects.
    pub fn should_reinitialize(&self, user_id: &str, key: &CacheKey) -> bool {
        self.lock().get(user_id).map_or(true, |s| s.key() != key)
    }

    pub fn install(&self, user_id: &str, session: ChatSession) {
        self.lock().insert(user_id.to_owned(), session);
    }

    pub fn prompt_for(&self, user_id: &str) -> Option<String> {
        self.lock().get(user_id).map(|s| s.system_prompt().to_owned())
    }

    pub fn invalidate(&self, user_id: &str) {
        self.lock().remove(user_id);
    }

    pub fn invalidate_all(&self) {
        self.lock().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }
}
