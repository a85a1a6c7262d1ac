//! Turn-taking: a user submission becomes one persisted user message and one
//! assistant message whose text grows as the model streams.

use crate::db::models::{now_millis, Attachment, Message};
use crate::llm::{GenerateRequest, LanguageModel, StreamChunk};
use crate::workspace::Workspace;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Chat name used when the first turn carries only attachments.
pub const ATTACHMENT_ONLY_CHAT_NAME: &str = "Image Query";
/// Reply text when generation fails before any text arrived.
pub const FALLBACK_ERROR_TEXT: &str = "Error occurred.";
const CHAT_NAME_MAX_CHARS: usize = 30;

/// Rejections raised before any state is touched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("Message must contain text or attachments")]
    EmptySubmission,
    #[error("Project not found: {0}")]
    ProjectNotFound(String),
    #[error("Chat not found: {0}")]
    ChatNotFound(String),
    #[error("A reply is already being generated for chat {0}")]
    ChatBusy(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    /// The model call failed; the reply message carries `is_error`.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub user_message_id: String,
    pub reply_message_id: String,
    pub status: TurnStatus,
}

/// Marks a chat as loading for as long as it lives.
struct InFlight<'a> {
    chats: &'a Mutex<HashSet<String>>,
    chat_id: String,
}

impl<'a> InFlight<'a> {
    fn acquire(chats: &'a Mutex<HashSet<String>>, chat_id: &str) -> Option<Self> {
        if !chats.lock().insert(chat_id.to_string()) {
            return None;
        }
        Some(Self {
            chats,
            chat_id: chat_id.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.chats.lock().remove(&self.chat_id);
    }
}

pub struct ConversationEngine {
    workspace: Arc<Workspace>,
    model: Arc<dyn LanguageModel>,
    in_flight: Mutex<HashSet<String>>,
}

impl ConversationEngine {
    pub fn new(workspace: Arc<Workspace>, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            workspace,
            model,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    /// Whether a reply is currently streaming into `chat_id`.
    pub fn is_loading(&self, chat_id: &str) -> bool {
        self.in_flight.lock().contains(chat_id)
    }

    /// Runs one turn to completion or failure.
    ///
    /// Validation problems are returned as `Err` with no state changed. Once
    /// the user message is appended the call always returns `Ok`; a model
    /// failure is recorded on the reply message and in `TurnOutcome::status`.
    pub async fn submit_turn(
        &self,
        project_id: &str,
        chat_id: &str,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<TurnOutcome, TurnError> {
        let text = text.trim();
        if text.is_empty() && attachments.is_empty() {
            return Err(TurnError::EmptySubmission);
        }
        let _guard = InFlight::acquire(&self.in_flight, chat_id)
            .ok_or_else(|| TurnError::ChatBusy(chat_id.to_string()))?;

        // History and documents are captured before the user message lands.
        let (history, documents) = self.workspace.read(|state| {
            let project = state
                .project(project_id)
                .ok_or_else(|| TurnError::ProjectNotFound(project_id.to_string()))?;
            let chat = project
                .chat(chat_id)
                .ok_or_else(|| TurnError::ChatNotFound(chat_id.to_string()))?;
            Ok::<_, TurnError>((chat.messages.clone(), project.documents.clone()))
        })?;

        let user_message = Message::user(text, attachments.clone());
        let user_message_id = user_message.id.clone();
        self.workspace
            .update(|state| {
                let chat = state
                    .chat_mut(project_id, chat_id)
                    .ok_or_else(|| TurnError::ChatNotFound(chat_id.to_string()))?;
                if chat.messages.len() <= 1 {
                    chat.name = chat_name_for(text);
                }
                chat.messages.push(user_message);
                chat.updated_at = chat.updated_at.max(now_millis());
                Ok::<_, TurnError>(())
            })?;

        let placeholder = Message::placeholder();
        let reply_id = placeholder.id.clone();
        self.workspace.update(|state| {
            if let Some(chat) = state.chat_mut(project_id, chat_id) {
                chat.messages.push(placeholder);
            }
        });
        tracing::info!(
            project = %project_id,
            chat = %chat_id,
            history = history.len(),
            documents = documents.len(),
            "Submitting turn"
        );

        let request = GenerateRequest {
            history,
            text: text.to_string(),
            attachments,
            documents,
        };
        let on_chunk = |chunk: StreamChunk| {
            if chunk.delta.is_empty() {
                return;
            }
            // Kept in memory; the final flag update below persists the text.
            let applied = self
                .workspace
                .append_to_message(project_id, chat_id, &reply_id, &chunk.delta);
            if !applied {
                tracing::debug!(chat = %chat_id, "Dropping chunk for a reply that no longer exists");
            }
        };

        let status = match self.model.generate(&request, &on_chunk).await {
            Ok(_) => {
                self.workspace
                    .update_message(project_id, chat_id, &reply_id, |message| {
                        message.is_streaming = false;
                    });
                tracing::info!(chat = %chat_id, "Turn completed");
                TurnStatus::Completed
            }
            Err(e) => {
                tracing::warn!(chat = %chat_id, "Generation failed: {}", e);
                self.workspace
                    .update_message(project_id, chat_id, &reply_id, |message| {
                        message.is_streaming = false;
                        message.is_error = true;
                        if message.text.is_empty() {
                            message.text = FALLBACK_ERROR_TEXT.to_string();
                        }
                    });
                TurnStatus::Failed(e.to_string())
            }
        };

        Ok(TurnOutcome {
            user_message_id,
            reply_message_id: reply_id,
            status,
        })
    }
}

/// First 30 characters of the text, or the attachment-only label.
fn chat_name_for(text: &str) -> String {
    if text.is_empty() {
        ATTACHMENT_ONLY_CHAT_NAME.to_string()
    } else {
        text.chars().take(CHAT_NAME_MAX_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{AttachmentKind, DocumentKind, Role};
    use crate::db::Database;
    use crate::llm::LlmError;
    use crate::store::ProjectStore;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    enum Step {
        Chunk(&'static str),
        Fail(&'static str),
    }

    /// Replays a fixed script and records the request it was given.
    struct ScriptedModel {
        steps: Vec<Step>,
        seen: Mutex<Option<GenerateRequest>>,
    }

    impl ScriptedModel {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps,
                seen: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn generate(
            &self,
            request: &GenerateRequest,
            on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
        ) -> Result<String, LlmError> {
            *self.seen.lock() = Some(request.clone());
            let mut full = String::new();
            for step in &self.steps {
                match step {
                    Step::Chunk(text) => {
                        full.push_str(text);
                        on_chunk(StreamChunk {
                            delta: text.to_string(),
                            done: false,
                        });
                    }
                    Step::Fail(message) => {
                        return Err(LlmError::Parse(message.to_string()));
                    }
                }
            }
            on_chunk(StreamChunk {
                delta: String::new(),
                done: true,
            });
            Ok(full)
        }
    }

    /// Emits "Hi", waits to be released, then emits " there".
    struct GatedModel {
        started: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl LanguageModel for GatedModel {
        async fn generate(
            &self,
            _request: &GenerateRequest,
            on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
        ) -> Result<String, LlmError> {
            on_chunk(StreamChunk {
                delta: "Hi".into(),
                done: false,
            });
            self.started.notify_one();
            self.gate.notified().await;
            on_chunk(StreamChunk {
                delta: " there".into(),
                done: false,
            });
            Ok("Hi there".into())
        }
    }

    fn setup(model: Arc<dyn LanguageModel>) -> (ConversationEngine, String, String) {
        let workspace = Arc::new(Workspace::load(ProjectStore::new(
            Database::in_memory().unwrap(),
        )));
        let project = workspace.create_project();
        let chat = workspace.create_chat(&project.id).unwrap();
        (ConversationEngine::new(workspace, model), project.id, chat.id)
    }

    fn image() -> Attachment {
        Attachment {
            kind: AttachmentKind::Image,
            mime_type: "image/png".into(),
            data: "iVBORw0KGgo=".into(),
            file_name: "scan.png".into(),
        }
    }

    #[tokio::test]
    async fn test_first_turn_appends_two_messages_and_renames() {
        let model = ScriptedModel::new(vec![Step::Chunk("Hi"), Step::Chunk(" there")]);
        let (engine, pid, cid) = setup(model.clone());

        let outcome = engine
            .submit_turn(&pid, &cid, "Hello world", vec![])
            .await
            .unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);

        let chat = engine.workspace().chat(&pid, &cid).unwrap();
        assert_eq!(chat.name, "Hello world");
        assert_eq!(chat.messages.len(), 3);
        assert_eq!(chat.messages[1].role, Role::User);
        assert_eq!(chat.messages[1].text, "Hello world");
        assert_eq!(chat.messages[1].id, outcome.user_message_id);

        let reply = &chat.messages[2];
        assert_eq!(reply.id, outcome.reply_message_id);
        assert_eq!(reply.role, Role::Model);
        assert_eq!(reply.text, "Hi there");
        assert!(!reply.is_streaming);
        assert!(!reply.is_error);
        assert!(!engine.is_loading(&cid));
    }

    #[tokio::test]
    async fn test_history_is_pre_submission_list() {
        let model = ScriptedModel::new(vec![Step::Chunk("ok")]);
        let (engine, pid, cid) = setup(model.clone());
        engine
            .workspace()
            .add_document(&pid, "facts", "Puri is by the sea", DocumentKind::Text)
            .unwrap();

        engine
            .submit_turn(&pid, &cid, "  Where is Puri?  ", vec![])
            .await
            .unwrap();

        let seen = model.seen.lock().clone().unwrap();
        assert_eq!(seen.history.len(), 1);
        assert_eq!(seen.text, "Where is Puri?");
        assert_eq!(seen.documents.len(), 1);
        assert_eq!(seen.documents[0].name, "facts");
    }

    #[tokio::test]
    async fn test_attachment_only_turn_is_named_image_query() {
        let model = ScriptedModel::new(vec![Step::Chunk("A scanned page")]);
        let (engine, pid, cid) = setup(model.clone());

        engine.submit_turn(&pid, &cid, "", vec![image()]).await.unwrap();

        let chat = engine.workspace().chat(&pid, &cid).unwrap();
        assert_eq!(chat.name, ATTACHMENT_ONLY_CHAT_NAME);
        assert_eq!(chat.messages[1].attachments, vec![image()]);
        assert_eq!(model.seen.lock().as_ref().unwrap().attachments.len(), 1);
    }

    #[tokio::test]
    async fn test_long_text_name_is_truncated_and_only_first_turn_renames() {
        let model = ScriptedModel::new(vec![Step::Chunk("ok")]);
        let (engine, pid, cid) = setup(model);
        let long = "ଓଡ଼ିଶା is a state on the eastern coast of India";

        engine.submit_turn(&pid, &cid, long, vec![]).await.unwrap();
        let name = engine.workspace().chat(&pid, &cid).unwrap().name;
        assert_eq!(name.chars().count(), 30);
        assert!(long.starts_with(&name));

        engine
            .submit_turn(&pid, &cid, "second question", vec![])
            .await
            .unwrap();
        let chat = engine.workspace().chat(&pid, &cid).unwrap();
        assert_eq!(chat.name, name);
        assert_eq!(chat.messages.len(), 5);
    }

    #[tokio::test]
    async fn test_updated_at_never_moves_backwards() {
        let model = ScriptedModel::new(vec![Step::Chunk("ok")]);
        let (engine, pid, cid) = setup(model);
        let future = now_millis() + 60_000;
        engine.workspace().update(|state| {
            state.chat_mut(&pid, &cid).unwrap().updated_at = future;
        });

        engine.submit_turn(&pid, &cid, "hi", vec![]).await.unwrap();
        assert_eq!(engine.workspace().chat(&pid, &cid).unwrap().updated_at, future);
    }

    #[tokio::test]
    async fn test_failure_after_partial_text_keeps_it() {
        let model = ScriptedModel::new(vec![Step::Chunk("Partial"), Step::Fail("network down")]);
        let (engine, pid, cid) = setup(model);

        let outcome = engine.submit_turn(&pid, &cid, "Hello", vec![]).await.unwrap();
        assert!(matches!(outcome.status, TurnStatus::Failed(ref m) if m.contains("network down")));

        let chat = engine.workspace().chat(&pid, &cid).unwrap();
        let reply = chat.message(&outcome.reply_message_id).unwrap();
        assert_eq!(reply.text, "Partial");
        assert!(!reply.is_streaming);
        assert!(reply.is_error);
        assert!(!engine.is_loading(&cid));
    }

    #[tokio::test]
    async fn test_finished_reply_text_reaches_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let open = || ProjectStore::new(Database::new(dir.path()).unwrap());
        let workspace = Arc::new(Workspace::load(open()));
        let project = workspace.create_project();
        let chat = workspace.create_chat(&project.id).unwrap();
        let model = ScriptedModel::new(vec![
            Step::Chunk("Part"),
            Step::Chunk("ial"),
            Step::Fail("network down"),
        ]);
        let engine = ConversationEngine::new(workspace, model);

        let outcome = engine
            .submit_turn(&project.id, &chat.id, "Hello", vec![])
            .await
            .unwrap();

        let stored = open().load_projects();
        let reply = stored[0].chats[0].message(&outcome.reply_message_id).unwrap();
        assert_eq!(reply.text, "Partial");
        assert!(reply.is_error);
        assert!(!reply.is_streaming);
    }

    #[tokio::test]
    async fn test_failure_without_text_uses_fallback() {
        let model = ScriptedModel::new(vec![Step::Fail("quota exceeded")]);
        let (engine, pid, cid) = setup(model);

        let outcome = engine.submit_turn(&pid, &cid, "Hello", vec![]).await.unwrap();
        let chat = engine.workspace().chat(&pid, &cid).unwrap();
        let reply = chat.message(&outcome.reply_message_id).unwrap();
        assert_eq!(reply.text, FALLBACK_ERROR_TEXT);
        assert!(reply.is_error);
        assert!(!reply.is_streaming);
    }

    #[tokio::test]
    async fn test_validation_rejections_leave_state_untouched() {
        let model = ScriptedModel::new(vec![Step::Chunk("unused")]);
        let (engine, pid, cid) = setup(model.clone());
        let before = engine.workspace().projects();

        assert_eq!(
            engine.submit_turn(&pid, &cid, "   ", vec![]).await,
            Err(TurnError::EmptySubmission)
        );
        assert_eq!(
            engine.submit_turn("nope", &cid, "hi", vec![]).await,
            Err(TurnError::ProjectNotFound("nope".into()))
        );
        assert_eq!(
            engine.submit_turn(&pid, "nope", "hi", vec![]).await,
            Err(TurnError::ChatNotFound("nope".into()))
        );

        assert_eq!(engine.workspace().projects(), before);
        assert!(model.seen.lock().is_none());
        assert!(!engine.is_loading(&cid));
        assert!(!engine.is_loading("nope"));
    }

    #[tokio::test]
    async fn test_stream_resolves_reply_by_id_under_concurrent_edits() {
        let model = Arc::new(GatedModel {
            started: Notify::new(),
            gate: Notify::new(),
        });
        let (engine, pid, cid) = setup(model.clone());
        let workspace = engine.workspace().clone();
        // A chat ahead of the streaming one, so deleting it shifts positions.
        let doomed = workspace.create_chat(&pid).unwrap();
        let other_project = workspace.create_project();

        let submit = engine.submit_turn(&pid, &cid, "Hello", vec![]);
        let interfere = async {
            model.started.notified().await;

            let chat = workspace.chat(&pid, &cid).unwrap();
            let streaming: Vec<_> = chat.messages.iter().filter(|m| m.is_streaming).collect();
            assert_eq!(streaming.len(), 1);
            assert_eq!(streaming[0].text, "Hi");
            assert!(engine.is_loading(&cid));
            assert_eq!(
                engine.submit_turn(&pid, &cid, "again", vec![]).await,
                Err(TurnError::ChatBusy(cid.clone()))
            );

            workspace.delete_chat(&pid, &doomed.id);
            workspace.create_chat(&pid).unwrap();
            workspace.delete_project(&other_project.id);
            model.gate.notify_one();
        };
        let (outcome, ()) = tokio::join!(submit, interfere);
        let outcome = outcome.unwrap();

        let chat = workspace.chat(&pid, &cid).unwrap();
        assert_eq!(chat.messages.len(), 3);
        let reply = chat.message(&outcome.reply_message_id).unwrap();
        assert_eq!(reply.text, "Hi there");
        assert!(!reply.is_streaming);
        assert_eq!(chat.streaming_count(), 0);
        assert!(workspace.chat(&pid, &doomed.id).is_none());
        assert_eq!(workspace.project(&pid).unwrap().chats.len(), 2);
    }

    #[tokio::test]
    async fn test_chat_deleted_mid_stream_is_tolerated() {
        let model = Arc::new(GatedModel {
            started: Notify::new(),
            gate: Notify::new(),
        });
        let (engine, pid, cid) = setup(model.clone());
        let workspace = engine.workspace().clone();

        let submit = engine.submit_turn(&pid, &cid, "Hello", vec![]);
        let interfere = async {
            model.started.notified().await;
            workspace.delete_chat(&pid, &cid);
            model.gate.notify_one();
        };
        let (outcome, ()) = tokio::join!(submit, interfere);

        assert_eq!(outcome.unwrap().status, TurnStatus::Completed);
        assert!(workspace.chat(&pid, &cid).is_none());
        assert!(!engine.is_loading(&cid));
    }
}
