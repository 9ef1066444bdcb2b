//! Chat message and request domain types.
//!
//! These are the wire-adjacent value objects that flow through the pipeline:
//! a client's `ChatRequest` is authenticated, enriched, handed to a backend
//! `Provider`, optionally round-tripped through the tool loop, and finally
//! wrapped in a signed completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A single part of a (possibly multimodal) message's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// A message's content, either a plain string or a list of parts.
///
/// Most requests use the plain-string form; multimodal requests use parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Concatenate all text segments, separated by newlines.
    pub fn extract_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.clone()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn has_image(&self) -> bool {
        matches!(self, Content::Parts(parts) if parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. })))
    }

    pub fn merge_text(&mut self, extra: &str) {
        match self {
            Content::Text(s) => {
                s.push_str("\n\n");
                s.push_str(extra);
            }
            Content::Parts(parts) => parts.push(ContentPart::Text {
                text: extra.to_string(),
            }),
        }
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

/// A tool call requested by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_call_type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Arguments as a raw JSON string, matching OpenAI's wire shape.
    pub arguments: String,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Content::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Content::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: None,
        }
    }
}

/// Insert-or-merge a system message at the front of a conversation.
///
/// If the first message is already a system message, the new content is
/// appended to it; otherwise a fresh system message is inserted at index 0.
pub fn ensure_system_content(messages: &mut Vec<ChatMessage>, extra: &str) {
    match messages.first_mut() {
        Some(m) if m.role == Role::System => m.content.merge_text(extra),
        _ => messages.insert(0, ChatMessage::system(extra)),
    }
}

/// The client-facing request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nilrag: Option<NilragOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NilragOptions {
    #[serde(default = "default_top_k")]
    pub top_k: u32,
}

fn default_top_k() -> u32 {
    2
}

impl ChatRequest {
    /// Validate the request bounds the orchestrator relies on (§3, §8).
    pub fn validate(&self) -> Result<(), String> {
        if self.messages.is_empty() {
            return Err("messages must not be empty".into());
        }
        if let Some(t) = self.temperature {
            if !(0.0..=5.0).contains(&t) {
                return Err("temperature must be within [0.0, 5.0]".into());
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err("top_p must be within [0.0, 1.0]".into());
            }
        }
        if let Some(mt) = self.max_tokens {
            if !(1..=100_000).contains(&mt) {
                return Err("max_tokens must be within [1, 100000]".into());
            }
        }
        Ok(())
    }

    pub fn has_multimodal_content(&self) -> bool {
        self.messages.iter().any(|m| m.content.has_image())
    }

    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.extract_text())
    }
}

/// A retrieved/fetched source surfaced alongside a response (web search, RAG).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// A new, server-assigned request identifier.
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Timestamp helper kept separate from `chrono::Utc::now()` call sites so the
/// gateway's `QueryLog` and response envelopes stamp a single consistent instant.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_concatenates_parts() {
        let content = Content::Parts(vec![
            ContentPart::Text { text: "first".into() },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "http://example.com/x.png".into(),
                },
            },
            ContentPart::Text {
                text: "second".into(),
            },
        ]);
        assert_eq!(content.extract_text(), "first\nsecond");
    }

    #[test]
    fn ensure_system_content_inserts_when_absent() {
        let mut messages = vec![ChatMessage::user("hi")];
        ensure_system_content(&mut messages, "context block");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content.extract_text(), "context block");
    }

    #[test]
    fn ensure_system_content_merges_when_present() {
        let mut messages = vec![ChatMessage::system("base"), ChatMessage::user("hi")];
        ensure_system_content(&mut messages, "extra");
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.extract_text().contains("base"));
        assert!(messages[0].content.extract_text().contains("extra"));
    }

    #[test]
    fn ensure_system_content_idempotent_index() {
        let mut messages = vec![ChatMessage::user("hi")];
        ensure_system_content(&mut messages, "a");
        ensure_system_content(&mut messages, "a");
        let system_count = messages.iter().filter(|m| m.role == Role::System).count();
        assert_eq!(system_count, 1);
    }

    #[test]
    fn validate_rejects_empty_messages() {
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: false,
            tools: vec![],
            tool_choice: None,
            web_search: None,
            nilrag: None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_temperature() {
        let mut req = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: Some(5.01),
            top_p: None,
            max_tokens: None,
            stream: false,
            tools: vec![],
            tool_choice: None,
            web_search: None,
            nilrag: None,
        };
        assert!(req.validate().is_err());
        req.temperature = Some(5.0);
        assert!(req.validate().is_ok());
    }
}
