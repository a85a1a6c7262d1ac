//! The owned application context: the project collection, the active
//! selection and the settings.
//!
//! All mutations go through one lock and address entities by id. After every
//! change to the project list the whole list is written back to the store;
//! write failures are logged and otherwise ignored. Streamed text deltas are
//! the exception: they stay in memory until the next persisted update.

use crate::db::models::{
    new_id, now_millis, Chat, DocumentKind, Message, Project, ProjectDocument, Settings,
};
use crate::documents::{load_document, DocumentError};
use crate::store::{encode_projects, ProjectStore};
use parking_lot::Mutex;
use std::path::Path;
use thiserror::Error;

pub const INITIAL_GREETING: &str = "Namaskar! I am OdiyaGPT. How can I assist you today?";
pub const NEW_CHAT_NAME: &str = "New Conversation";
pub const NEW_PROJECT_DESCRIPTION: &str = "New Project";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),
    #[error("Chat not found: {0}")]
    ChatNotFound(String),
    #[error("Document name and content must not be empty")]
    InvalidDocument,
    #[error(transparent)]
    Document(#[from] DocumentError),
}

#[derive(Debug, Clone, Default)]
pub struct AppState {
    /// Newest first.
    pub projects: Vec<Project>,
    pub active_project_id: Option<String>,
    pub active_chat_id: Option<String>,
}

impl AppState {
    pub fn project(&self, project_id: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == project_id)
    }

    pub fn project_mut(&mut self, project_id: &str) -> Option<&mut Project> {
        self.projects.iter_mut().find(|p| p.id == project_id)
    }

    pub fn chat_mut(&mut self, project_id: &str, chat_id: &str) -> Option<&mut Chat> {
        self.project_mut(project_id)?.chat_mut(chat_id)
    }
}

pub struct Workspace {
    state: Mutex<AppState>,
    settings: Mutex<Settings>,
    store: ProjectStore,
    /// Taken before the state lock is released so writes land in mutation order.
    writer: Mutex<()>,
}

impl Workspace {
    /// Reads projects and settings once from the store.
    pub fn load(store: ProjectStore) -> Self {
        let projects = store.load_projects();
        let settings = store.load_settings();
        tracing::info!(projects = projects.len(), "Workspace loaded");
        Self {
            state: Mutex::new(AppState {
                projects,
                ..AppState::default()
            }),
            settings: Mutex::new(settings),
            store,
            writer: Mutex::new(()),
        }
    }

    /// Applies `f` to the latest state, then persists the project list.
    ///
    /// The list is encoded under the state lock; the store write happens after
    /// the state lock is released.
    pub fn update<R>(&self, f: impl FnOnce(&mut AppState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        let encoded = encode_projects(&state.projects);
        let _writer = self.writer.lock();
        drop(state);

        if let Err(e) = encoded.and_then(|json| self.store.save_encoded_projects(&json)) {
            tracing::warn!("Failed to persist projects: {}", e);
        }
        result
    }

    /// Appends streamed text to a message without writing to the store.
    /// Returns false if the project, chat or message no longer exists.
    pub fn append_to_message(
        &self,
        project_id: &str,
        chat_id: &str,
        message_id: &str,
        delta: &str,
    ) -> bool {
        let mut state = self.state.lock();
        match state
            .chat_mut(project_id, chat_id)
            .and_then(|chat| chat.message_mut(message_id))
        {
            Some(message) => {
                message.text.push_str(delta);
                true
            }
            None => false,
        }
    }

    /// Applies `f` to one message, resolved by id. Returns false if the
    /// project, chat or message no longer exists.
    pub fn update_message(
        &self,
        project_id: &str,
        chat_id: &str,
        message_id: &str,
        f: impl FnOnce(&mut Message),
    ) -> bool {
        self.update(|state| {
            match state
                .chat_mut(project_id, chat_id)
                .and_then(|chat| chat.message_mut(message_id))
            {
                Some(message) => {
                    f(message);
                    true
                }
                None => false,
            }
        })
    }

    pub fn read<R>(&self, f: impl FnOnce(&AppState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn projects(&self) -> Vec<Project> {
        self.read(|state| state.projects.clone())
    }

    pub fn project(&self, project_id: &str) -> Option<Project> {
        self.read(|state| state.project(project_id).cloned())
    }

    pub fn chat(&self, project_id: &str, chat_id: &str) -> Option<Chat> {
        self.read(|state| state.project(project_id)?.chat(chat_id).cloned())
    }

    pub fn active_project_id(&self) -> Option<String> {
        self.read(|state| state.active_project_id.clone())
    }

    pub fn active_chat_id(&self) -> Option<String> {
        self.read(|state| state.active_chat_id.clone())
    }

    // ── Projects ──

    pub fn create_project(&self) -> Project {
        let project = self.update(|state| {
            let now = now_millis();
            let project = Project {
                id: new_id(),
                name: format!("Project {}", state.projects.len() + 1),
                description: NEW_PROJECT_DESCRIPTION.to_string(),
                created_at: now,
                updated_at: now,
                chats: Vec::new(),
                documents: Vec::new(),
            };
            state.projects.insert(0, project.clone());
            state.active_project_id = Some(project.id.clone());
            state.active_chat_id = None;
            project
        });
        tracing::info!(project = %project.id, name = %project.name, "Created project");
        project
    }

    /// Removes the project with all of its chats and documents.
    pub fn delete_project(&self, project_id: &str) {
        self.update(|state| {
            state.projects.retain(|p| p.id != project_id);
            if state.active_project_id.as_deref() == Some(project_id) {
                state.active_project_id = None;
                state.active_chat_id = None;
            }
        });
        tracing::info!(project = %project_id, "Deleted project");
    }

    pub fn select_project(&self, project_id: &str) -> Result<(), WorkspaceError> {
        let mut state = self.state.lock();
        if state.project(project_id).is_none() {
            return Err(WorkspaceError::ProjectNotFound(project_id.to_string()));
        }
        state.active_project_id = Some(project_id.to_string());
        state.active_chat_id = None;
        Ok(())
    }

    // ── Chats ──

    /// Creates a chat seeded with the greeting and selects it.
    pub fn create_chat(&self, project_id: &str) -> Result<Chat, WorkspaceError> {
        let chat = self.update(|state| {
            let project = state
                .project_mut(project_id)
                .ok_or_else(|| WorkspaceError::ProjectNotFound(project_id.to_string()))?;
            let now = now_millis();
            let chat = Chat {
                id: new_id(),
                name: NEW_CHAT_NAME.to_string(),
                created_at: now,
                updated_at: now,
                messages: vec![Message::model(INITIAL_GREETING)],
            };
            project.chats.insert(0, chat.clone());
            state.active_project_id = Some(project_id.to_string());
            state.active_chat_id = Some(chat.id.clone());
            Ok::<_, WorkspaceError>(chat)
        })?;
        tracing::info!(project = %project_id, chat = %chat.id, "Created chat");
        Ok(chat)
    }

    pub fn delete_chat(&self, project_id: &str, chat_id: &str) {
        self.update(|state| {
            if let Some(project) = state.project_mut(project_id) {
                project.chats.retain(|c| c.id != chat_id);
            }
            if state.active_chat_id.as_deref() == Some(chat_id) {
                state.active_chat_id = None;
            }
        });
        tracing::info!(project = %project_id, chat = %chat_id, "Deleted chat");
    }

    pub fn select_chat(&self, project_id: &str, chat_id: &str) -> Result<(), WorkspaceError> {
        let mut state = self.state.lock();
        let project = state
            .project(project_id)
            .ok_or_else(|| WorkspaceError::ProjectNotFound(project_id.to_string()))?;
        if project.chat(chat_id).is_none() {
            return Err(WorkspaceError::ChatNotFound(chat_id.to_string()));
        }
        state.active_project_id = Some(project_id.to_string());
        state.active_chat_id = Some(chat_id.to_string());
        Ok(())
    }

    // ── Documents ──

    pub fn add_document(
        &self,
        project_id: &str,
        name: &str,
        content: &str,
        kind: DocumentKind,
    ) -> Result<ProjectDocument, WorkspaceError> {
        if name.trim().is_empty() || content.trim().is_empty() {
            return Err(WorkspaceError::InvalidDocument);
        }
        self.insert_document(project_id, ProjectDocument::new(name, content, kind))
    }

    /// Reads a `.txt`, `.md` or `.pdf` file into the project's documents.
    pub fn import_document(
        &self,
        project_id: &str,
        path: &Path,
    ) -> Result<ProjectDocument, WorkspaceError> {
        let document = load_document(path)?;
        self.insert_document(project_id, document)
    }

    fn insert_document(
        &self,
        project_id: &str,
        document: ProjectDocument,
    ) -> Result<ProjectDocument, WorkspaceError> {
        self.update(|state| {
            let project = state
                .project_mut(project_id)
                .ok_or_else(|| WorkspaceError::ProjectNotFound(project_id.to_string()))?;
            project.documents.push(document.clone());
            Ok::<_, WorkspaceError>(())
        })?;
        tracing::info!(project = %project_id, document = %document.name, "Added document");
        Ok(document)
    }

    pub fn delete_document(&self, project_id: &str, document_id: &str) {
        self.update(|state| {
            if let Some(project) = state.project_mut(project_id) {
                project.documents.retain(|d| d.id != document_id);
            }
        });
    }

    // ── Settings ──

    pub fn settings(&self) -> Settings {
        self.settings.lock().clone()
    }

    pub fn update_settings(&self, settings: Settings) {
        let mut current = self.settings.lock();
        *current = settings;
        if let Err(e) = self.store.save_settings(&current) {
            tracing::warn!("Failed to persist settings: {}", e);
        }
    }
}
