use crate::db::models::{new_id, now_millis, DocumentKind, ProjectDocument};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Document name and content must not be empty")]
    Empty,
    #[error("Unsupported file type: .{0}")]
    Unsupported(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF parse error: {0}")]
    Pdf(String),
}

impl ProjectDocument {
    pub fn new(name: impl Into<String>, content: impl Into<String>, kind: DocumentKind) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            content: content.into(),
            kind,
            created_at: now_millis(),
        }
    }
}

/// Read a document file into a context document named after the file
pub fn load_document(path: &Path) -> Result<ProjectDocument, DocumentError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let (content, kind) = match ext.as_str() {
        "txt" | "md" | "markdown" => (fs::read_to_string(path)?, DocumentKind::Text),
        "pdf" => {
            let bytes = fs::read(path)?;
            let content = pdf_extract::extract_text_from_mem(&bytes)
                .map_err(|e| DocumentError::Pdf(e.to_string()))?;
            (content, DocumentKind::Pdf)
        }
        _ => return Err(DocumentError::Unsupported(ext)),
    };

    if content.trim().is_empty() {
        return Err(DocumentError::Empty);
    }
    Ok(ProjectDocument::new(name, content, kind))
}

/// Serialize documents into the knowledge-base dump injected into the prompt
pub fn render_context(documents: &[ProjectDocument]) -> String {
    documents
        .iter()
        .map(|doc| {
            format!(
                "--- DOCUMENT: {} ---\n{}\n--- END DOCUMENT ---",
                doc.name, doc.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
