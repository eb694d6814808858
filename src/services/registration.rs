//! Registration, priority and queue bookkeeping for one user.
//!
//! The manager holds a [`RegistrationSnapshot`] read from the store. Every
//! mutation follows the same apply-then-reconcile shape: install a tentative
//! snapshot, issue the write, then replace the snapshot with a fresh
//! authoritative read whatever the write's outcome was. Rollback is therefore
//! always a re-read, never a hand-computed inverse.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
};

use serde::Serialize;

use crate::{
    errors::{AppError, AppResult},
    models::Registration,
    store::RegistrationStore,
};

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationSnapshot {
    /// Ordered by priority; priorities are exactly `1..=len`.
    pub registrations:     Vec<Registration>,
    /// Course id → number of registrants.
    pub queues:            HashMap<String, i64>,
    pub completed:         HashSet<String>,
    pub max_registrations: usize,
    pub profile_complete:  bool,
}

impl RegistrationSnapshot {
    pub fn is_registered(&self, course_id: &str) -> bool {
        self.registrations.iter().any(|r| r.course_id == course_id)
    }

    pub fn priority_of(&self, course_id: &str) -> Option<i32> {
        self.registrations
            .iter()
            .find(|r| r.course_id == course_id)
            .map(|r| r.priority)
    }

    pub fn queue_length(&self, course_id: &str) -> i64 {
        self.queues.get(course_id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ToggleOutcome {
    #[serde(rename_all = "camelCase")]
    Registered {
        priority:              i32,
        /// The user's English level is below the course minimum (or unknown).
        /// Informational only, registration still goes through.
        english_level_warning: bool,
    },
    Unregistered,
}

pub struct RegistrationManager<'a, S: RegistrationStore + ?Sized> {
    store:   &'a S,
    user_id: String,
    max:     usize,
    state:   RegistrationSnapshot,
}

impl<'a, S: RegistrationStore + ?Sized> RegistrationManager<'a, S> {
    pub async fn load(store: &'a S, user_id: &str, max_registrations: usize) -> AppResult<Self> {
        let state = read_snapshot(store, user_id, max_registrations).await?;
        Ok(Self {
            store,
            user_id: user_id.to_owned(),
            max: max_registrations,
            state,
        })
    }

    pub fn snapshot(&self) -> &RegistrationSnapshot {
        &self.state
    }

    pub fn into_snapshot(self) -> RegistrationSnapshot {
        self.state
    }

    /// Register for `course_id`, or unregister if already registered.
    pub async fn toggle_registration(&mut self, course_id: &str) -> AppResult<ToggleOutcome> {
        if self.state.is_registered(course_id) {
            let tentative = without_registration(&self.state, course_id);
            let store = self.store;
            let user_id = self.user_id.clone();
            self.apply_then_reconcile(tentative, store.remove_registration(&user_id, course_id))
                .await?;
            tracing::info!(user_id = %self.user_id, course_id, "Registration removed");
            return Ok(ToggleOutcome::Unregistered);
        }

        let course = self.store.course(course_id).await?.ok_or(AppError::NotFound)?;
        if self.state.completed.contains(course_id) {
            return Err(AppError::Eligibility {
                code:    "already_completed",
                message: "You have already completed this course".into(),
            });
        }
        if !course.is_active {
            return Err(AppError::BadRequest("This course is not open for registration".into()));
        }
        if self.state.registrations.len() >= self.max {
            return Err(AppError::Capacity(format!(
                "You can register for at most {} courses",
                self.max
            )));
        }
        let profile = self.store.profile(&self.user_id).await?.unwrap_or_default();
        if !profile.is_complete() {
            return Err(AppError::Eligibility {
                code:    "profile_incomplete",
                message: "Please complete your profile before registering".into(),
            });
        }

        let english_level_warning = match (profile.english_level, course.min_english_level) {
            (_, None) => false,
            (Some(level), minimum) => !level.meets(minimum),
            (None, Some(_)) => true,
        };

        let tentative = with_registration(&self.state, course_id);
        let store = self.store;
        let user_id = self.user_id.clone();
        let max = self.max;
        self.apply_then_reconcile(tentative, store.add_registration(&user_id, course_id, max))
            .await?;

        let priority = self.state.priority_of(course_id).unwrap_or(self.state.registrations.len() as i32);
        tracing::info!(user_id = %self.user_id, course_id, priority, english_level_warning, "Registered");
        Ok(ToggleOutcome::Registered { priority, english_level_warning })
    }

    /// Move `course_id` to `new_priority`, shifting the others to keep `1..=N`.
    ///
    /// Targets outside `1..=N` are rejected and leave everything untouched.
    pub async fn update_priority(&mut self, course_id: &str, new_priority: i32) -> AppResult<()> {
        let Some(current) = self.state.priority_of(course_id) else {
            return Err(AppError::NotFound);
        };
        let count = self.state.registrations.len() as i32;
        if !(1..=count).contains(&new_priority) {
            return Err(AppError::BadRequest(format!(
                "Priority must be between 1 and {count}"
            )));
        }
        if current == new_priority {
            return Ok(());
        }

        let ordered = reorder(&self.state.registrations, course_id, new_priority);
        let mut tentative = self.state.clone();
        tentative.registrations = renumber(&ordered);

        let store = self.store;
        let user_id = self.user_id.clone();
        self.apply_then_reconcile(tentative, store.set_priorities(&user_id, &ordered))
            .await?;
        tracing::info!(user_id = %self.user_id, course_id, new_priority, "Priority updated");
        Ok(())
    }

    async fn apply_then_reconcile<W>(&mut self, tentative: RegistrationSnapshot, write: W) -> AppResult<()>
    where
        W: Future<Output = AppResult<()>>,
    {
        let previous = std::mem::replace(&mut self.state, tentative);
        let outcome = write.await;

        match read_snapshot(self.store, &self.user_id, self.max).await {
            Ok(fresh) => self.state = fresh,
            Err(err) => {
                tracing::warn!(user_id = %self.user_id, error = ?err, "Reconcile after registration write failed");
                if outcome.is_err() {
                    // The tentative state never happened; keep the last authoritative one.
                    self.state = previous;
                }
            }
        }
        outcome
    }
}

async fn read_snapshot<S: RegistrationStore + ?Sized>(
    store: &S,
    user_id: &str,
    max_registrations: usize,
) -> AppResult<RegistrationSnapshot> {
    let registrations = store.registrations_for_user(user_id).await?;
    let queues = store.queue_lengths().await?;
    let completed = store.completed_course_ids(user_id).await?;
    let profile_complete = store
        .profile(user_id)
        .await?
        .is_some_and(|p| p.is_complete());

    Ok(RegistrationSnapshot {
        registrations,
        queues,
        completed,
        max_registrations,
        profile_complete,
    })
}

fn with_registration(state: &RegistrationSnapshot, course_id: &str) -> RegistrationSnapshot {
    let mut next = state.clone();
    next.registrations.push(Registration {
        course_id: course_id.to_owned(),
        priority:  state.registrations.len() as i32 + 1,
    });
    *next.queues.entry(course_id.to_owned()).or_insert(0) += 1;
    next
}

fn without_registration(state: &RegistrationSnapshot, course_id: &str) -> RegistrationSnapshot {
    let mut next = state.clone();
    let remaining: Vec<String> = state
        .registrations
        .iter()
        .filter(|r| r.course_id != course_id)
        .map(|r| r.course_id.clone())
        .collect();
    next.registrations = renumber(&remaining);
    if let Some(q) = next.queues.get_mut(course_id) {
        *q = (*q - 1).max(0);
    }
    next
}

/// Course ids in their new order after moving `course_id` to `new_priority`.
fn reorder(registrations: &[Registration], course_id: &str, new_priority: i32) -> Vec<String> {
    let mut ids: Vec<String> = registrations.iter().map(|r| r.course_id.clone()).collect();
    if let Some(pos) = ids.iter().position(|c| c == course_id) {
        let moved = ids.remove(pos);
        let target = (new_priority - 1).clamp(0, ids.len() as i32) as usize;
        ids.insert(target, moved);
    }
    ids
}

fn renumber(ordered: &[String]) -> Vec<Registration> {
    ordered
        .iter()
        .enumerate()
        .map(|(idx, id)| Registration { course_id: id.clone(), priority: idx as i32 + 1 })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::{
        models::{Course, Difficulty, EnglishLevel, UserProfile},
        store::memory::MemoryStore,
    };

    const USER: &str = "u1";

    fn course(id: &str, min: Option<EnglishLevel>) -> Course {
        Course {
            id:                id.into(),
            title:             format!("Course {id}"),
            category_id:       None,
            category_name:     None,
            description:       "desc".into(),
            difficulty:        Difficulty::Beginner,
            min_english_level: min,
            next_session_date: None,
            is_active:         true,
            translations:      vec![],
        }
    }

    fn complete_profile(level: Option<EnglishLevel>) -> UserProfile {
        UserProfile {
            user_id:       USER.into(),
            full_name:     Some("Jan Kowalski".into()),
            phone:         Some("+48 600 100 200".into()),
            address:       Some("ul. Długa 1".into()),
            postal_code:   Some("00-001".into()),
            date_of_birth: NaiveDate::from_ymd_opt(1995, 3, 1),
            english_level: level,
        }
    }

    fn store_with(courses: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        for id in courses {
            store.add_course(course(id, None));
        }
        store.set_profile(complete_profile(Some(EnglishLevel::B2)));
        store
    }

    fn priorities(snapshot: &RegistrationSnapshot) -> Vec<(String, i32)> {
        snapshot
            .registrations
            .iter()
            .map(|r| (r.course_id.clone(), r.priority))
            .collect()
    }

    #[tokio::test]
    async fn register_then_unregister_updates_queue() {
        let store = store_with(&["c1"]);
        store.seed_registration("other", "c1", 1);
        let mut mgr = RegistrationManager::load(&store, USER, 3).await.unwrap();
        assert_eq!(mgr.snapshot().queue_length("c1"), 1);

        let outcome = mgr.toggle_registration("c1").await.unwrap();
        assert_eq!(outcome, ToggleOutcome::Registered { priority: 1, english_level_warning: false });
        assert_eq!(mgr.snapshot().queue_length("c1"), 2);

        let outcome = mgr.toggle_registration("c1").await.unwrap();
        assert_eq!(outcome, ToggleOutcome::Unregistered);
        assert_eq!(mgr.snapshot().queue_length("c1"), 1);
        assert!(!mgr.snapshot().is_registered("c1"));
    }

    #[tokio::test]
    async fn completed_course_cannot_be_registered() {
        let store = store_with(&["c1"]);
        store.complete(USER, "c1");
        let mut mgr = RegistrationManager::load(&store, USER, 3).await.unwrap();

        let err = mgr.toggle_registration("c1").await.unwrap_err();
        assert_eq!(err.code(), "already_completed");
        assert!(!mgr.snapshot().is_registered("c1"));
    }

    #[tokio::test]
    async fn completion_outranks_deactivation() {
        let store = MemoryStore::new();
        store.add_course(Course { is_active: false, ..course("c1", None) });
        store.set_profile(complete_profile(Some(EnglishLevel::B2)));
        store.complete(USER, "c1");
        let mut mgr = RegistrationManager::load(&store, USER, 3).await.unwrap();

        let err = mgr.toggle_registration("c1").await.unwrap_err();
        assert_eq!(err.code(), "already_completed");
    }

    #[tokio::test]
    async fn cap_leaves_registrations_unchanged() {
        let store = store_with(&["c1", "c2", "c3"]);
        let mut mgr = RegistrationManager::load(&store, USER, 2).await.unwrap();
        mgr.toggle_registration("c1").await.unwrap();
        mgr.toggle_registration("c2").await.unwrap();
        let before = mgr.snapshot().clone();

        let err = mgr.toggle_registration("c3").await.unwrap_err();
        assert!(matches!(err, AppError::Capacity(_)));
        assert_eq!(mgr.snapshot(), &before);
        assert_eq!(store.registrations_for_user(USER).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn incomplete_profile_blocks_registration() {
        let store = store_with(&["c1"]);
        let mut profile = complete_profile(None);
        profile.phone = None;
        store.set_profile(profile);
        let mut mgr = RegistrationManager::load(&store, USER, 3).await.unwrap();

        let err = mgr.toggle_registration("c1").await.unwrap_err();
        assert_eq!(err.code(), "profile_incomplete");
    }

    #[tokio::test]
    async fn english_level_is_advisory_only() {
        let store = MemoryStore::new();
        store.add_course(course("c1", Some(EnglishLevel::B1)));
        store.set_profile(complete_profile(Some(EnglishLevel::A2)));
        let mut mgr = RegistrationManager::load(&store, USER, 3).await.unwrap();

        let outcome = mgr.toggle_registration("c1").await.unwrap();
        assert_eq!(outcome, ToggleOutcome::Registered { priority: 1, english_level_warning: true });
        assert!(mgr.snapshot().is_registered("c1"));
    }

    #[tokio::test]
    async fn failed_write_reconciles_to_store_state() {
        let store = store_with(&["c1"]);
        let mut mgr = RegistrationManager::load(&store, USER, 3).await.unwrap();

        store.fail_next_write();
        assert!(mgr.toggle_registration("c1").await.is_err());
        assert!(!mgr.snapshot().is_registered("c1"));
        assert_eq!(mgr.snapshot().queue_length("c1"), 0);
    }

    #[tokio::test]
    async fn removal_compacts_priorities() {
        let store = store_with(&["c1", "c2", "c3"]);
        let mut mgr = RegistrationManager::load(&store, USER, 3).await.unwrap();
        for id in ["c1", "c2", "c3"] {
            mgr.toggle_registration(id).await.unwrap();
        }

        mgr.toggle_registration("c2").await.unwrap();
        assert_eq!(
            priorities(mgr.snapshot()),
            vec![("c1".to_string(), 1), ("c3".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn priority_moves_and_shifts_others() {
        let store = store_with(&["c1", "c2", "c3"]);
        let mut mgr = RegistrationManager::load(&store, USER, 3).await.unwrap();
        for id in ["c1", "c2", "c3"] {
            mgr.toggle_registration(id).await.unwrap();
        }

        mgr.update_priority("c3", 1).await.unwrap();
        assert_eq!(
            priorities(mgr.snapshot()),
            vec![("c3".to_string(), 1), ("c1".to_string(), 2), ("c2".to_string(), 3)]
        );
        let stored: Vec<i32> = store
            .registrations_for_user(USER)
            .await
            .unwrap()
            .iter()
            .map(|r| r.priority)
            .collect();
        assert_eq!(stored, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn out_of_range_priority_is_rejected_without_changes() {
        let store = store_with(&["c1", "c2"]);
        let mut mgr = RegistrationManager::load(&store, USER, 3).await.unwrap();
        mgr.toggle_registration("c1").await.unwrap();
        mgr.toggle_registration("c2").await.unwrap();
        let before = mgr.snapshot().clone();

        for target in [0, 3, -1] {
            let err = mgr.update_priority("c1", target).await.unwrap_err();
            assert!(matches!(err, AppError::BadRequest(_)));
        }
        assert_eq!(mgr.snapshot(), &before);
    }

    #[tokio::test]
    async fn inactive_course_is_not_registrable() {
        let store = MemoryStore::new();
        let mut c = course("c1", None);
        c.is_active = false;
        store.add_course(c);
        store.set_profile(complete_profile(None));
        let mut mgr = RegistrationManager::load(&store, USER, 3).await.unwrap();

        assert!(matches!(mgr.toggle_registration("c1").await, Err(AppError::BadRequest(_))));
        assert!(matches!(mgr.toggle_registration("nope").await, Err(AppError::NotFound)));
    }

    #[test]
    fn reorder_moves_down_as_well_as_up() {
        let regs = renumber(&["a".into(), "b".into(), "c".into()]);
        assert_eq!(reorder(&regs, "a", 3), vec!["b", "c", "a"]);
        assert_eq!(reorder(&regs, "c", 2), vec!["a", "c", "b"]);
    }
}
