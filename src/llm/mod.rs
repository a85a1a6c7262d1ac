pub mod gemini;
pub mod prompt;

use crate::db::models::{Attachment, Message, ProjectDocument};
use async_trait::async_trait;

/// One generation call: prior history, the new turn, and the project documents
/// used as retrieval context.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub history: Vec<Message>,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub documents: Vec<ProjectDocument>,
}

impl GenerateRequest {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.attachments.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub delta: String,
    pub done: bool,
}

/// Streaming text generation backend.
///
/// Implementations call `on_chunk` once per text delta, in emission order,
/// and return the full concatenated text.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(
        &self,
        request: &GenerateRequest,
        on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
    ) -> Result<String, LlmError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Message must contain text or attachments")]
    EmptyRequest,
    #[error("Language model API key not configured")]
    MissingApiKey,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
}
