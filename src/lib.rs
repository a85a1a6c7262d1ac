pub mod config;
pub mod db;
pub mod documents;
pub mod engine;
pub mod llm;
pub mod store;
pub mod vision;
pub mod workspace;

use config::AppConfig;
use db::Database;
use engine::ConversationEngine;
use llm::gemini::GeminiClient;
use std::sync::Arc;
use store::{ProjectStore, StorageError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workspace::Workspace;

/// Installs the fmt subscriber; `RUST_LOG` overrides the default filter.
/// Calling it more than once is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ai_assistant=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Opens the local store and loads the workspace from it.
pub fn open(config: &AppConfig) -> Result<Workspace, StorageError> {
    let database = Database::new(&config.data_dir)?;
    Ok(Workspace::load(ProjectStore::new(database)))
}

/// Workspace plus a Gemini-backed conversation engine.
pub fn open_engine(config: &AppConfig) -> Result<ConversationEngine, StorageError> {
    let workspace = Arc::new(open(config)?);
    let model = Arc::new(GeminiClient::new(config.gemini()));
    Ok(ConversationEngine::new(workspace, model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(dir: PathBuf) -> AppConfig {
        AppConfig {
            data_dir: dir,
            ..AppConfig::from_lookup(|_| None)
        }
    }

    #[test]
    fn test_open_creates_and_reloads_workspace() {
        init_tracing();
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().join("nested"));

        let project_id = {
            let engine = open_engine(&cfg).unwrap();
            engine.workspace().create_project().id
        };
        let workspace = open(&cfg).unwrap();
        assert!(workspace.project(&project_id).is_some());
    }
}
