//! Persistence of the project list and settings into local key/value slots.
//!
//! Both slots hold JSON. Reads happen once at startup and never fail: a
//! malformed slot falls back to an empty project list or default settings.
//! Projects written by an older schema (no `chats` field) are migrated on load.

use crate::db::models::{new_id, now_millis, Chat, Project, Settings};
use crate::db::Database;
use serde_json::Value;
use thiserror::Error;

pub const PROJECTS_KEY: &str = "ai-assistant-projects";
pub const SETTINGS_KEY: &str = "ai-assistant-settings";

/// Name given to the chat synthesized for legacy projects.
pub const LEGACY_CHAT_NAME: &str = "General Chat";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Malformed stored state: {0}")]
    Malformed(String),
}

pub struct ProjectStore {
    db: Database,
}

impl ProjectStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Loads the project list, defaulting to empty on any failure.
    pub fn load_projects(&self) -> Vec<Project> {
        match self.try_load_projects() {
            Ok(projects) => projects,
            Err(e) => {
                tracing::warn!("Discarding stored projects: {}", e);
                Vec::new()
            }
        }
    }

    pub fn try_load_projects(&self) -> Result<Vec<Project>, StorageError> {
        match self.db.get_slot(PROJECTS_KEY)? {
            Some(raw) => decode_projects(&raw),
            None => Ok(Vec::new()),
        }
    }

    /// Writes a project list already produced by [`encode_projects`].
    pub fn save_encoded_projects(&self, json: &str) -> Result<(), StorageError> {
        self.db.set_slot(PROJECTS_KEY, json)?;
        Ok(())
    }

    /// Loads settings, defaulting to an empty vision key on any failure.
    pub fn load_settings(&self) -> Settings {
        match self.try_load_settings() {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Discarding stored settings: {}", e);
                Settings::default()
            }
        }
    }

    pub fn try_load_settings(&self) -> Result<Settings, StorageError> {
        match self.db.get_slot(SETTINGS_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Settings::default()),
        }
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<(), StorageError> {
        let json = serde_json::to_string(settings)?;
        self.db.set_slot(SETTINGS_KEY, &json)?;
        Ok(())
    }
}

pub fn encode_projects(projects: &[Project]) -> Result<String, StorageError> {
    Ok(serde_json::to_string(projects)?)
}

/// Decodes a stored project list, migrating legacy entries.
pub fn decode_projects(raw: &str) -> Result<Vec<Project>, StorageError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Array(entries) = value else {
        return Err(StorageError::Malformed("project list is not an array".into()));
    };

    let mut projects = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = if entry.get("chats").map_or(true, Value::is_null) {
            migrate_legacy(entry)?
        } else {
            entry
        };
        projects.push(serde_json::from_value(entry)?);
    }
    Ok(projects)
}

/// Wraps a legacy project's top-level `messages` into a single chat.
fn migrate_legacy(mut entry: Value) -> Result<Value, StorageError> {
    let Value::Object(ref mut fields) = entry else {
        return Err(StorageError::Malformed("project entry is not an object".into()));
    };

    let created_at = fields
        .get("createdAt")
        .and_then(Value::as_i64)
        .unwrap_or_else(now_millis);
    let updated_at = fields
        .get("updatedAt")
        .and_then(Value::as_i64)
        .unwrap_or(created_at);
    let messages = match fields.remove("messages") {
        Some(Value::Array(items)) => serde_json::from_value(Value::Array(items))?,
        _ => Vec::new(),
    };

    let chat = Chat {
        id: new_id(),
        name: LEGACY_CHAT_NAME.to_string(),
        created_at,
        updated_at,
        messages,
    };
    let project_id = fields.get("id").and_then(Value::as_str).unwrap_or("?");
    tracing::info!(
        project = %project_id,
        messages = chat.messages.len(),
        "Migrated legacy project into a single chat"
    );

    fields.insert("chats".into(), serde_json::to_value(vec![chat])?);
    fields.insert("documents".into(), Value::Array(Vec::new()));
    fields.entry("createdAt").or_insert(Value::from(created_at));
    fields.entry("updatedAt").or_insert(Value::from(updated_at));
    Ok(entry)
}
