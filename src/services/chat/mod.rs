//! Course assistant: builds the per-user system prompt, streams the model's
//! reply chunk by chunk and keeps the chat history.

pub mod gemini;
pub mod prompt;
pub mod session;

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    errors::{AppError, AppResult},
    models::{ChatMessage, ChatRole, InstructionKind},
    store::ChatContextStore,
};

use gemini::{ChatModel, ModelError, ModelRequest, ModelTurn};
use prompt::{build_system_prompt, CacheKey, Instructions, PromptContext};
use session::{ChatSession, ChatSessions};

pub const MAX_MESSAGE_CHARS: usize = 4000;

const UNAVAILABLE_MESSAGE: &str = "The assistant is unavailable right now. Please try again in a moment.";

/// What the chat endpoint forwards to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Chunk { text: String },
    #[serde(rename_all = "camelCase")]
    Done { message_id: Option<String>, interrupted: bool },
    Error { code: String, message: String },
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Chunk { .. } => "chunk",
            ChatEvent::Done { .. }  => "done",
            ChatEvent::Error { .. } => "error",
        }
    }
}

enum Attempt {
    Completed,
    Cancelled,
    Failed(ModelError),
}

pub struct ChatService {
    model:         Option<Arc<dyn ChatModel>>,
    sessions:      ChatSessions,
    history_limit: i64,
}

impl ChatService {
    pub fn new(model: Option<Arc<dyn ChatModel>>, history_limit: i64) -> Self {
        Self { model, sessions: ChatSessions::new(), history_limit }
    }

    pub fn is_configured(&self) -> bool {
        self.model.is_some()
    }

    /// Drop the user's session so the next message rebuilds the prompt.
    pub fn invalidate(&self, user_id: &str) {
        self.sessions.invalidate(user_id);
    }

    pub fn invalidate_all(&self) {
        self.sessions.invalidate_all();
    }

    /// The user's system prompt, rebuilt only on cold start, when the cache
    /// key changed, or when `force` is set.
    pub async fn prepare<S>(&self, store: &S, user_id: &str, language: &str, force: bool) -> AppResult<String>
    where
        S: ChatContextStore + ?Sized,
    {
        let courses = store.active_courses().await?;
        let english_level = store.english_level(user_id).await?;
        let key = CacheKey::new(&courses, language, english_level);

        if !force && !self.sessions.should_reinitialize(user_id, &key) {
            if let Some(prompt) = self.sessions.prompt_for(user_id) {
                return Ok(prompt);
            }
        }

        let completed = store.user_completions(user_id).await?;
        let instructions = load_instructions(store).await?;
        let today = Utc::now().date_naive();
        let events = store.upcoming_public_events(today).await?;

        let system_prompt = build_system_prompt(&PromptContext {
            courses: &courses,
            completed: &completed,
            language,
            english_level,
            instructions: &instructions,
            events: &events,
            today,
        })?;

        self.sessions.install(user_id, ChatSession::new(key, system_prompt.clone()));
        tracing::info!(user_id, language, force, "Chat session initialized");
        Ok(system_prompt)
    }

    /// Send `message` and forward the reply over `tx`.
    ///
    /// Errors that happen before the model is contacted (bad input, missing
    /// configuration) are returned. Once streaming starts, failures are
    /// reported as a [`ChatEvent::Error`] and recorded in the history.
    pub async fn respond<S>(
        &self,
        store: &S,
        user_id: &str,
        language: &str,
        message: &str,
        cancel: CancellationToken,
        tx: mpsc::Sender<ChatEvent>,
    ) -> AppResult<()>
    where
        S: ChatContextStore + ?Sized,
    {
        let message = validate_message(message)?;
        let model = self
            .model
            .clone()
            .ok_or_else(|| AppError::Configuration("GEMINI_API_KEY is not configured".into()))?;

        // Fails fast on missing bot instructions before anything is stored.
        let mut system_prompt = self.prepare(store, user_id, language, false).await?;

        let history = conversation_turns(store.recent_messages(user_id, self.history_limit).await?);

        store.append_message(user_id, ChatRole::User, message, false, false).await?;

        // A failure before the first chunk gets exactly one retry on a rebuilt session.
        let mut reply = String::new();
        let mut retried = false;
        let outcome = loop {
            let request = ModelRequest {
                system_prompt: system_prompt.clone(),
                history:       history.clone(),
                message:       message.to_owned(),
            };
            match stream_reply(model.as_ref(), request, &cancel, &tx, &mut reply).await {
                Attempt::Failed(err) if !retried && reply.is_empty() => {
                    tracing::warn!(user_id, error = %err, "Chat stream failed, reinitializing session");
                    retried = true;
                    self.sessions.invalidate(user_id);
                    system_prompt = self.prepare(store, user_id, language, true).await?;
                }
                other => break other,
            }
        };

        match outcome {
            Attempt::Completed => {
                let saved = store
                    .append_message(user_id, ChatRole::Assistant, &reply, false, false)
                    .await?;
                let _ = tx
                    .send(ChatEvent::Done { message_id: Some(saved.id), interrupted: false })
                    .await;
            }
            Attempt::Cancelled => {
                tracing::info!(user_id, chars = reply.len(), "Chat stream cancelled");
                let message_id = if reply.is_empty() {
                    None
                } else {
                    let saved = store
                        .append_message(user_id, ChatRole::Assistant, &reply, false, true)
                        .await?;
                    Some(saved.id)
                };
                let _ = tx.send(ChatEvent::Done { message_id, interrupted: true }).await;
            }
            Attempt::Failed(err) => {
                tracing::error!(user_id, error = %err, "Chat stream failed after retry");
                if reply.is_empty() {
                    store
                        .append_message(user_id, ChatRole::Assistant, UNAVAILABLE_MESSAGE, true, false)
                        .await?;
                } else {
                    store
                        .append_message(user_id, ChatRole::Assistant, &reply, false, true)
                        .await?;
                }
                let err = AppError::Upstream(UNAVAILABLE_MESSAGE.into());
                let _ = tx
                    .send(ChatEvent::Error { code: err.code().into(), message: err.public_message() })
                    .await;
            }
        }
        Ok(())
    }
}

/// Trimmed message, or `BadRequest` when it is blank or too long.
pub fn validate_message(message: &str) -> AppResult<&str> {
    let message = message.trim();
    if message.is_empty() {
        return Err(AppError::BadRequest("Message must not be empty".into()));
    }
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(AppError::BadRequest(format!(
            "Message must be at most {MAX_MESSAGE_CHARS} characters"
        )));
    }
    Ok(message)
}

async fn load_instructions<S>(store: &S) -> AppResult<Instructions>
where
    S: ChatContextStore + ?Sized,
{
    let main = store
        .instruction(InstructionKind::Main)
        .await?
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            AppError::Configuration("Bot instructions are missing; an administrator must configure them".into())
        })?;

    Ok(Instructions {
        main,
        contacts:       store.instruction(InstructionKind::Contacts).await?,
        external_links: store.instruction(InstructionKind::ExternalLinks).await?,
    })
}

/// One model call. Appends every forwarded chunk to `reply`. A closed
/// receiver counts as cancellation.
async fn stream_reply(
    model: &dyn ChatModel,
    request: ModelRequest,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<ChatEvent>,
    reply: &mut String,
) -> Attempt {
    let mut stream = match model.stream(request, cancel.clone()).await {
        Ok(stream) => stream,
        Err(ModelError::Cancelled) => return Attempt::Cancelled,
        Err(err) => return Attempt::Failed(err),
    };

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Cancelled,
            item = stream.next() => item,
        };
        match item {
            None => return Attempt::Completed,
            Some(Ok(text)) => {
                reply.push_str(&text);
                if tx.send(ChatEvent::Chunk { text }).await.is_err() {
                    cancel.cancel();
                    return Attempt::Cancelled;
                }
            }
            Some(Err(ModelError::Cancelled)) => return Attempt::Cancelled,
            Some(Err(err)) => return Attempt::Failed(err),
        }
    }
}

/// Stored messages as model context, strictly alternating and ending on an
/// assistant turn. Error replies are dropped; a question left unanswered by
/// them is superseded by the next one.
fn conversation_turns(messages: Vec<ChatMessage>) -> Vec<ModelTurn> {
    let mut turns: Vec<ModelTurn> = Vec::new();
    for m in messages.into_iter().filter(|m| !m.is_error && !m.content.is_empty()) {
        match turns.last_mut() {
            Some(last) if last.role == m.role => match m.role {
                ChatRole::User => last.text = m.content,
                ChatRole::Assistant => {
                    last.text.push_str("\n\n");
                    last.text.push_str(&m.content);
                }
            },
            _ => turns.push(ModelTurn { role: m.role, text: m.content }),
        }
    }
    if turns.last().is_some_and(|t| t.role == ChatRole::User) {
        turns.pop();
    }
    turns
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use super::*;
    use crate::{
        models::{Course, Difficulty, EnglishLevel, UserProfile},
        store::memory::MemoryStore,
    };
    use gemini::ChunkStream;

    enum Script {
        Reply(Vec<&'static str>),
        FailToOpen,
        FailAfter(Vec<&'static str>),
        Hang(Vec<&'static str>),
    }

    /// Plays one script per call and records the system prompt it was given.
    struct FakeModel {
        scripts: Mutex<VecDeque<Script>>,
        prompts: Mutex<Vec<String>>,
        calls:   AtomicUsize,
    }

    impl FakeModel {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                prompts: Mutex::new(Vec::new()),
                calls:   AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn service(model: &Arc<FakeModel>) -> ChatService {
        let model: Arc<dyn ChatModel> = model.clone();
        ChatService::new(Some(model), 20)
    }

    fn ok_chunks(chunks: Vec<&'static str>) -> Vec<Result<String, ModelError>> {
        chunks.into_iter().map(|c| Ok(c.to_owned())).collect()
    }

    #[async_trait]
    impl ChatModel for FakeModel {
        async fn stream(&self, request: ModelRequest, _cancel: CancellationToken) -> Result<ChunkStream, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request.system_prompt);
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or(Script::FailToOpen);
            match script {
                Script::Reply(chunks) => Ok(futures::stream::iter(ok_chunks(chunks)).boxed()),
                Script::FailToOpen => Err(ModelError::Status { status: 503, body: "overloaded".into() }),
                Script::FailAfter(chunks) => {
                    let mut items = ok_chunks(chunks);
                    items.push(Err(ModelError::Transport("reset".into())));
                    Ok(futures::stream::iter(items).boxed())
                }
                Script::Hang(chunks) => Ok(futures::stream::iter(ok_chunks(chunks))
                    .chain(futures::stream::pending())
                    .boxed()),
            }
        }
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.add_course(Course {
            id:                "c1".into(),
            title:             "Welding".into(),
            category_id:       None,
            category_name:     None,
            description:       "Basics".into(),
            difficulty:        Difficulty::Beginner,
            min_english_level: None,
            next_session_date: NaiveDate::from_ymd_opt(2030, 1, 1),
            is_active:         true,
            translations:      vec![],
        });
        store.set_profile(UserProfile {
            user_id: "u1".into(),
            english_level: Some(EnglishLevel::B1),
            ..Default::default()
        });
        store.set_instruction(InstructionKind::Main, "You help people pick courses.\n{{COURSES_LIST}}");
        store
    }

    async fn run(
        service: &ChatService,
        store: &MemoryStore,
        message: &str,
        cancel: CancellationToken,
    ) -> (AppResult<()>, Vec<ChatEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let result = service.respond(store, "u1", "en", message, cancel, tx).await;
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        (result, events)
    }

    #[tokio::test]
    async fn streams_chunks_and_persists_both_turns() {
        let store = store();
        let model = FakeModel::new(vec![Script::Reply(vec!["Try ", "welding."])]);
        let service = service(&model);

        let (result, events) = run(&service, &store, "What should I take?", CancellationToken::new()).await;
        result.unwrap();

        assert_eq!(events[0], ChatEvent::Chunk { text: "Try ".into() });
        assert_eq!(events[1], ChatEvent::Chunk { text: "welding.".into() });
        assert!(matches!(&events[2], ChatEvent::Done { message_id: Some(_), interrupted: false }));

        let history = store.messages_for("u1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, ChatRole::User);
        assert_eq!(history[1].content, "Try welding.");
        assert!(model.prompts.lock().unwrap()[0].contains("- Welding"));
    }

    #[tokio::test]
    async fn session_is_reused_until_the_key_changes() {
        let store = store();
        let model = FakeModel::new(vec![
            Script::Reply(vec!["a"]),
            Script::Reply(vec!["b"]),
            Script::Reply(vec!["c"]),
        ]);
        let service = service(&model);

        run(&service, &store, "one", CancellationToken::new()).await.0.unwrap();
        let reads = store.instruction_reads();
        run(&service, &store, "two", CancellationToken::new()).await.0.unwrap();
        assert_eq!(store.instruction_reads(), reads, "cached session must not reload instructions");

        store.set_course_title("c1", "Advanced welding");
        run(&service, &store, "three", CancellationToken::new()).await.0.unwrap();
        assert!(store.instruction_reads() > reads);
        assert!(model.prompts.lock().unwrap()[2].contains("Advanced welding"));
    }

    #[tokio::test]
    async fn a_failed_open_is_retried_once_with_a_fresh_session() {
        let store = store();
        let model = FakeModel::new(vec![Script::FailToOpen, Script::Reply(vec!["ok"])]);
        let service = service(&model);

        let (result, events) = run(&service, &store, "hi", CancellationToken::new()).await;
        result.unwrap();

        assert_eq!(model.calls(), 2);
        assert_eq!(events[0], ChatEvent::Chunk { text: "ok".into() });
        assert!(matches!(events.last(), Some(ChatEvent::Done { interrupted: false, .. })));
    }

    #[tokio::test]
    async fn a_second_failure_is_surfaced_and_recorded() {
        let store = store();
        let model = FakeModel::new(vec![Script::FailToOpen, Script::FailToOpen, Script::Reply(vec!["never"])]);
        let service = service(&model);

        let (result, events) = run(&service, &store, "hi", CancellationToken::new()).await;
        result.unwrap();

        assert_eq!(model.calls(), 2);
        assert!(matches!(&events[..], [ChatEvent::Error { code, .. }] if code == "upstream"));
        let history = store.messages_for("u1");
        assert!(history[1].is_error);
    }

    #[tokio::test]
    async fn failure_after_partial_output_is_not_retried() {
        let store = store();
        let model = FakeModel::new(vec![Script::FailAfter(vec!["Part"]), Script::Reply(vec!["never"])]);
        let service = service(&model);

        let (_, events) = run(&service, &store, "hi", CancellationToken::new()).await;

        assert_eq!(model.calls(), 1);
        assert_eq!(events[0], ChatEvent::Chunk { text: "Part".into() });
        assert!(matches!(events[1], ChatEvent::Error { .. }));
        let saved = store.messages_for("u1");
        assert_eq!(saved[1].content, "Part");
        assert!(saved[1].interrupted);
    }

    #[tokio::test]
    async fn missing_instructions_fail_before_anything_is_stored() {
        let store = store();
        store.set_instruction(InstructionKind::Main, "  ");
        let model = FakeModel::new(vec![Script::Reply(vec!["x"])]);
        let service = service(&model);

        let (result, events) = run(&service, &store, "hi", CancellationToken::new()).await;

        assert!(matches!(result, Err(AppError::Configuration(_))));
        assert!(events.is_empty());
        assert_eq!(model.calls(), 0);
        assert!(store.messages_for("u1").is_empty());
    }

    #[tokio::test]
    async fn missing_model_is_a_configuration_error() {
        let store = store();
        let service = ChatService::new(None, 20);
        let (result, _) = run(&service, &store, "hi", CancellationToken::new()).await;
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }

    #[tokio::test]
    async fn cancellation_keeps_the_partial_reply() {
        let store = Arc::new(store());
        let model = FakeModel::new(vec![Script::Hang(vec!["Half an answer"])]);
        let service = Arc::new(service(&model));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        let task = {
            let (store, service, cancel) = (store.clone(), service.clone(), cancel.clone());
            tokio::spawn(async move { service.respond(store.as_ref(), "u1", "en", "hi", cancel, tx).await })
        };

        assert_eq!(rx.recv().await, Some(ChatEvent::Chunk { text: "Half an answer".into() }));
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert!(matches!(rx.recv().await, Some(ChatEvent::Done { interrupted: true, message_id: Some(_) })));
        let saved = store.messages_for("u1");
        assert_eq!(saved[1].content, "Half an answer");
        assert!(saved[1].interrupted);
    }

    #[tokio::test]
    async fn blank_messages_are_rejected() {
        let store = store();
        let service = service(&FakeModel::new(vec![]));
        let (result, _) = run(&service, &store, "   ", CancellationToken::new()).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    fn stored(role: ChatRole, content: &str, is_error: bool) -> ChatMessage {
        ChatMessage {
            id:          content.into(),
            role,
            content:     content.into(),
            created_at:  Utc::now().naive_utc(),
            is_error,
            interrupted: false,
        }
    }

    #[test]
    fn failed_replies_leave_no_consecutive_user_turns() {
        let turns = conversation_turns(vec![
            stored(ChatRole::User, "first question", false),
            stored(ChatRole::Assistant, UNAVAILABLE_MESSAGE, true),
            stored(ChatRole::User, "asked again", false),
            stored(ChatRole::Assistant, "an answer", false),
            stored(ChatRole::User, "cancelled before any text", false),
        ]);
        let roles: Vec<ChatRole> = turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![ChatRole::User, ChatRole::Assistant]);
        assert_eq!(turns[0].text, "asked again");
        assert_eq!(turns[1].text, "an answer");
    }
}
