//! In-process change feed.
//!
//! Every write to the store publishes a [`ChangeEvent`]. Views subscribe with
//! a set of [`SubscriptionSpec`]s and get one debounced callback per burst of
//! matching changes. The callback carries no payload: subscribers always
//! re-read authoritative state, so duplicate, dropped, or reordered events
//! never corrupt anything.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

use super::debounce::Debouncer;

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Users,
    Courses,
    CourseSessions,
    CourseCategories,
    Registrations,
    CourseCompletions,
    CalendarEvents,
    UserProfiles,
    BotInstructions,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Users             => "users",
            Table::Courses           => "courses",
            Table::CourseSessions    => "course_sessions",
            Table::CourseCategories  => "course_categories",
            Table::Registrations     => "registrations",
            Table::CourseCompletions => "course_completions",
            Table::CalendarEvents    => "calendar_events",
            Table::UserProfiles      => "user_profiles",
            Table::BotInstructions   => "bot_instructions",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "users"              => Ok(Table::Users),
            "courses"            => Ok(Table::Courses),
            "course_sessions"    => Ok(Table::CourseSessions),
            "course_categories"  => Ok(Table::CourseCategories),
            "registrations"      => Ok(Table::Registrations),
            "course_completions" => Ok(Table::CourseCompletions),
            "calendar_events"    => Ok(Table::CalendarEvents),
            "user_profiles"      => Ok(Table::UserProfiles),
            "bot_instructions"   => Ok(Table::BotInstructions),
            other                => Err(format!("Unknown table '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table:     Table,
    pub kind:      ChangeKind,
    pub user_id:   Option<String>,
    pub course_id: Option<String>,
}

impl ChangeEvent {
    pub fn new(table: Table, kind: ChangeKind) -> Self {
        Self { table, kind, user_id: None, course_id: None }
    }

    pub fn user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_owned());
        self
    }

    pub fn course(mut self, course_id: &str) -> Self {
        self.course_id = Some(course_id.to_owned());
        self
    }
}

/// Which change kinds a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Only(ChangeKind),
}

/// Advisory row filter. Access control is enforced by the handlers that
/// serve the re-fetch, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    UserId(String),
    CourseId(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub table:  Table,
    pub event:  EventFilter,
    pub filter: Option<RowFilter>,
}

impl SubscriptionSpec {
    pub fn table(table: Table) -> Self {
        Self { table, event: EventFilter::All, filter: None }
    }

    pub fn only(mut self, kind: ChangeKind) -> Self {
        self.event = EventFilter::Only(kind);
        self
    }

    pub fn filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if self.table != event.table {
            return false;
        }
        if let EventFilter::Only(kind) = self.event {
            if kind != event.kind {
                return false;
            }
        }
        // Events that do not carry the filtered column still match.
        match &self.filter {
            None => true,
            Some(RowFilter::UserId(id)) => event.user_id.as_ref().map_or(true, |u| u == id),
            Some(RowFilter::CourseId(id)) => event.course_id.as_ref().map_or(true, |c| c == id),
        }
    }
}

#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        tracing::debug!(table = %event.table, kind = ?event.kind, "Change published");
        // No subscribers is the normal idle state.
        let _ = self.tx.send(event);
    }

    /// Subscribe to `specs`; `on_change` runs once per debounced burst.
    /// The subscription lives exactly as long as the returned handle.
    pub fn subscribe<F>(&self, specs: Vec<SubscriptionSpec>, window: Duration, on_change: F) -> Subscription
    where
        F: FnMut() + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let debouncer = Debouncer::new(window, on_change);

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if specs.iter().any(|s| s.matches(&event)) {
                            debouncer.trigger();
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Change feed subscriber lagged; forcing refresh");
                        debouncer.trigger();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Subscription { task }
    }
}

/// Handle for a live subscription. Dropping it tears the subscription down,
/// including any debounce timer still pending.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
