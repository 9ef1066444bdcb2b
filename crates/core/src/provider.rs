//! The `Provider` trait — abstraction over OpenAI-compatible inference backends.
//!
//! A backend is resolved per-request from the service registry (`ModelEndpoint`)
//! and wrapped in a `Provider` implementation that speaks its wire protocol.
//! The orchestrator calls `complete()` or `stream()` without knowing which
//! concrete backend answered.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::ChatMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens = self.prompt_tokens + self.completion_tokens;
    }
}

/// A complete (non-streaming) backend response, kept close to the raw
/// OpenAI-compatible JSON shape so it can be re-serialized with minimal
/// reshaping once signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub id: String,
    pub model: String,
    pub message: ChatMessage,
    pub finish_reason: String,
    pub usage: Option<Usage>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// A single SSE chunk relayed from the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_call_deltas: Vec<crate::message::ToolCall>,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// The chunk's original JSON, preserved so the gateway can re-emit it
    /// byte-for-byte except for the `sources` field added to the final chunk.
    pub raw: serde_json::Value,
}

/// A live OpenAI-compatible backend reached over HTTP.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Default implementation wraps `complete()` as a single terminal chunk;
    /// real backends (see `attestgate-providers`) override this with genuine
    /// SSE streaming.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError>
    {
        let response = self.complete(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx
            .send(Ok(StreamChunk {
                content: Some(response.message.content.extract_text()),
                tool_call_deltas: response.message.tool_calls,
                done: true,
                usage: response.usage,
                raw: response.raw,
            }))
            .await;
        Ok(rx)
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_add_recomputes_total() {
        let mut a = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        let b = Usage {
            prompt_tokens: 3,
            completion_tokens: 7,
            total_tokens: 10,
        };
        a.add(&b);
        assert_eq!(a.prompt_tokens, 13);
        assert_eq!(a.completion_tokens, 12);
        assert_eq!(a.total_tokens, 25);
    }
}
