use crate::db::models::{OcrResult, TextBlock, Vertex};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://vision.googleapis.com";

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("Google Vision API Key is missing. Please add it in Settings.")]
    MissingApiKey,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{message}")]
    Api { status: u16, message: String },
}

/// Optical character recognition backend.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, base64_image: &str, api_key: &str)
        -> Result<OcrResult, VisionError>;
}

#[derive(Serialize)]
struct AnnotateRequest<'a> {
    requests: Vec<AnnotateImageRequest<'a>>,
}

#[derive(Serialize)]
struct AnnotateImageRequest<'a> {
    image: ImageContent<'a>,
    features: Vec<Feature>,
}

#[derive(Serialize)]
struct ImageContent<'a> {
    content: &'a str,
}

#[derive(Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    text_annotations: Vec<EntityAnnotation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityAnnotation {
    #[serde(default)]
    description: String,
    #[serde(default)]
    bounding_poly: Option<BoundingPoly>,
}

#[derive(Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<RawVertex>,
}

#[derive(Deserialize)]
struct RawVertex {
    x: Option<i64>,
    y: Option<i64>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

/// The first annotation is the whole text; the rest are word-level blocks.
fn into_result(response: AnnotateResponse) -> OcrResult {
    let Some(first) = response.responses.into_iter().next() else {
        return OcrResult::default();
    };
    let mut annotations = first.text_annotations.into_iter();
    let Some(full) = annotations.next() else {
        return OcrResult::default();
    };

    let blocks = annotations
        .map(|ann| TextBlock {
            text: ann.description,
            bounding_box: ann
                .bounding_poly
                .map(|poly| {
                    poly.vertices
                        .into_iter()
                        .map(|v| Vertex {
                            x: v.x.unwrap_or(0),
                            y: v.y.unwrap_or(0),
                        })
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect();

    OcrResult {
        full_text: full.description,
        blocks,
    }
}

/// Google Cloud Vision `images:annotate` client.
#[derive(Debug, Clone)]
pub struct VisionClient {
    base_url: String,
}

impl VisionClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for VisionClient {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

#[async_trait]
impl TextExtractor for VisionClient {
    async fn extract_text(
        &self,
        base64_image: &str,
        api_key: &str,
    ) -> Result<OcrResult, VisionError> {
        if api_key.is_empty() {
            return Err(VisionError::MissingApiKey);
        }

        let body = AnnotateRequest {
            requests: vec![AnnotateImageRequest {
                image: ImageContent {
                    content: base64_image,
                },
                features: vec![Feature {
                    kind: "TEXT_DETECTION",
                }],
            }],
        };

        let resp = Client::new()
            .post(format!(
                "{}/v1/images:annotate",
                self.base_url.trim_end_matches('/')
            ))
            .query(&[("key", api_key)])
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .ok()
                .and_then(|b| b.error)
                .and_then(|e| e.message)
                .unwrap_or_else(|| "Failed to perform OCR".to_string());
            tracing::warn!(status, "OCR request failed: {}", message);
            return Err(VisionError::Api { status, message });
        }

        let data: AnnotateResponse = resp.json().await?;
        let result = into_result(data);
        tracing::debug!(blocks = result.blocks.len(), "OCR completed");
        Ok(result)
    }
}
