use super::prompt::{replayable_history, system_instruction};
use super::{GenerateRequest, LanguageModel, LlmError, StreamChunk};
use crate::db::models::{Attachment, Message};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
}

impl GeminiConfig {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    system_instruction: GeminiInstruction,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct GeminiInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct GeminiStreamResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Deserialize)]
struct GeminiErrorBody {
    error: GeminiErrorDetail,
}

#[derive(Deserialize)]
struct GeminiErrorDetail {
    message: String,
}

/// Attachments first, then text, as the API expects for mixed turns.
fn to_parts(text: &str, attachments: &[Attachment]) -> Vec<GeminiPart> {
    let mut parts: Vec<GeminiPart> = attachments
        .iter()
        .map(|att| GeminiPart {
            text: None,
            inline_data: Some(InlineData {
                mime_type: att.mime_type.clone(),
                data: att.data.clone(),
            }),
        })
        .collect();
    if !text.is_empty() {
        parts.push(GeminiPart {
            text: Some(text.to_string()),
            inline_data: None,
        });
    }
    parts
}

fn to_content(message: &Message) -> GeminiContent {
    GeminiContent {
        role: message.role.as_str().to_string(),
        parts: to_parts(&message.text, &message.attachments),
    }
}

fn build_request(config: &GeminiConfig, request: &GenerateRequest) -> GeminiRequest {
    let mut contents: Vec<GeminiContent> = replayable_history(&request.history)
        .map(to_content)
        .collect();
    contents.push(GeminiContent {
        role: "user".to_string(),
        parts: to_parts(&request.text, &request.attachments),
    });

    GeminiRequest {
        contents,
        system_instruction: GeminiInstruction {
            parts: vec![GeminiPart {
                text: Some(system_instruction(&request.documents)),
                inline_data: None,
            }],
        },
        generation_config: GenerationConfig {
            temperature: config.temperature,
        },
    }
}

fn chunk_text(response: &GeminiStreamResponse) -> String {
    response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<String>()
        })
        .unwrap_or_default()
}

pub async fn chat_stream(
    config: &GeminiConfig,
    request: &GenerateRequest,
    on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
) -> Result<String, LlmError> {
    if request.is_empty() {
        return Err(LlmError::EmptyRequest);
    }
    if config.api_key.is_empty() {
        return Err(LlmError::MissingApiKey);
    }

    let client = Client::new();
    let body = build_request(config, request);

    let resp = client
        .post(format!(
            "{}/v1beta/models/{}:streamGenerateContent",
            config.base_url.trim_end_matches('/'),
            config.model
        ))
        .query(&[("alt", "sse")])
        .header("Content-Type", "application/json")
        .header("x-goog-api-key", &config.api_key)
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<GeminiErrorBody>(&text)
            .map(|body| body.error.message)
            .unwrap_or(text);
        return Err(LlmError::Api { status, message });
    }

    let mut full_content = String::new();
    let mut stream = resp.bytes_stream();
    // Raw bytes: a network chunk may end inside a multi-byte character.
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8(raw).map_err(|e| LlmError::Parse(e.to_string()))?;
            let line = line.trim();

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if let Ok(error) = serde_json::from_str::<GeminiErrorBody>(data) {
                return Err(LlmError::Api {
                    status: 200,
                    message: error.error.message,
                });
            }
            let parsed = serde_json::from_str::<GeminiStreamResponse>(data)
                .map_err(|e| LlmError::Parse(e.to_string()))?;
            let text = chunk_text(&parsed);
            if !text.is_empty() {
                full_content.push_str(&text);
                on_chunk(StreamChunk {
                    delta: text,
                    done: false,
                });
            }
        }
    }

    on_chunk(StreamChunk {
        delta: String::new(),
        done: true,
    });
    Ok(full_content)
}

/// Gemini REST client streaming over server-sent events.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn generate(
        &self,
        request: &GenerateRequest,
        on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
    ) -> Result<String, LlmError> {
        chat_stream(&self.config, request, on_chunk).await
    }
}
