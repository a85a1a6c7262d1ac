use crate::llm::gemini::{self, GeminiConfig};
use crate::vision;
use std::env;
use std::path::PathBuf;

/// Runtime configuration, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Language model credential; `GEMINI_API_KEY`, falling back to `API_KEY`.
    pub gemini_api_key: String,
    pub model: String,
    pub gemini_base_url: String,
    pub vision_base_url: String,
    /// Directory holding `ai-assistant.db`.
    pub data_dir: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("No .env loaded: {}", e);
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            gemini_api_key: non_empty("GEMINI_API_KEY")
                .or_else(|| non_empty("API_KEY"))
                .unwrap_or_default(),
            model: non_empty("AI_ASSISTANT_MODEL")
                .unwrap_or_else(|| gemini::DEFAULT_MODEL.to_string()),
            gemini_base_url: non_empty("AI_ASSISTANT_GEMINI_URL")
                .unwrap_or_else(|| gemini::DEFAULT_BASE_URL.to_string()),
            vision_base_url: non_empty("AI_ASSISTANT_VISION_URL")
                .unwrap_or_else(|| vision::DEFAULT_BASE_URL.to_string()),
            data_dir: non_empty("AI_ASSISTANT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_data_dir),
        }
    }

    pub fn gemini(&self) -> GeminiConfig {
        GeminiConfig {
            base_url: self.gemini_base_url.clone(),
            model: self.model.clone(),
            ..GeminiConfig::new(self.gemini_api_key.clone())
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("ai-assistant"))
        .unwrap_or_else(|| PathBuf::from(".ai-assistant"))
}
