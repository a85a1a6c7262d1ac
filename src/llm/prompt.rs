//! System prompt and history construction for the language model.

use crate::db::models::{Message, ProjectDocument};
use crate::documents::render_context;

pub const SYSTEM_INSTRUCTION: &str = r#"
You are **OdiyaGPT**, a state-of-the-art AI assistant specifically designed for the people of Odisha.

**IDENTITY:**
1. Your name is OdiyaGPT.
2. You are helpful, polite, and knowledgeable about global topics and specifically knowledgeable about Odia culture, language, history, and geography.

**LANGUAGE & TONE RULES:**
1. **Always respond in English** unless the user explicitly requests another language.
2. If the user asks in Odia, reply in Odia (using proper Odia script).
3. Be concise, clear, and professional.

**PROJECT CONTEXT & RAG:**
1. You are operating within a specific "Project".
2. You have access to "Project Documents" which act as a Knowledge Base. Use this context to answer questions accurately.
3. If information is found in the Project Documents, cite it.

**RESOURCE HANDLING:**
1. Users may upload Images or PDFs in the chat.
2. Analyze these files deeply.

**SAFETY:**
1. Politely refuse unsafe, illegal, or harmful requests.
"#;

const KNOWLEDGE_BASE_HEADER: &str = "**PROJECT KNOWLEDGE BASE (RAG CONTEXT):**\nUse the following project documents to answer user queries. Do not invent facts not present here if the question implies looking up facts.";

/// Base instruction, followed by the document dump when there are documents.
pub fn system_instruction(documents: &[ProjectDocument]) -> String {
    let mut instruction = SYSTEM_INSTRUCTION.to_string();
    if !documents.is_empty() {
        instruction.push_str("\n\n");
        instruction.push_str(KNOWLEDGE_BASE_HEADER);
        instruction.push_str("\n\n");
        instruction.push_str(&render_context(documents));
    }
    instruction
}

/// Messages worth replaying: no failed replies, nothing without content.
pub fn replayable_history(messages: &[Message]) -> impl Iterator<Item = &Message> {
    messages
        .iter()
        .filter(|m| !m.is_error && (!m.text.trim().is_empty() || !m.attachments.is_empty()))
}
