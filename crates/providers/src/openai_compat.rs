//! An OpenAI-compatible inference backend reached at a URL resolved by the
//! service registry. `ChatMessage` and `ProviderRequest` already serialize to
//! (almost exactly) the OpenAI chat-completions wire shape, so request
//! construction is a thin pass-through; the work here is response parsing,
//! error-code mapping, and SSE framing for the streaming path.

use std::collections::HashMap;

use async_trait::async_trait;
use attestgate_core::error::ProviderError;
use attestgate_core::message::{ChatMessage, Content, Role, ToolCall, ToolCallFunction};
use attestgate_core::provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

/// A backend speaking the OpenAI chat-completions protocol, with no
/// authentication — the registry only ever hands out URLs for inference
/// servers the gateway itself trusts on the network.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            client,
        }
    }

    /// Build an `OpenAiCompatProvider` for a model endpoint discovered via
    /// `attestgate-registry`; `base_url` is `ModelEndpoint.url`.
    pub fn for_endpoint(model: &str, base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self::new(model, base_url, client)
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = %self.name, model = %request.model, "dispatching completion");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::REQUEST_TIMEOUT || status == reqwest::StatusCode::GATEWAY_TIMEOUT {
            return Err(ProviderError::Timeout(format!("backend returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(provider = %self.name, %status, "backend returned an error");
            return Err(ProviderError::ApiError {
                status_code: status.as_u16(),
                message: body,
            });
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::ApiError {
                status_code: status.as_u16(),
                message: format!("failed to parse backend response: {e}"),
            })?;

        let parsed: ApiResponse = serde_json::from_value(raw.clone()).map_err(|e| ProviderError::ApiError {
            status_code: status.as_u16(),
            message: format!("unexpected response shape: {e}"),
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: status.as_u16(),
                message: "backend returned no choices".to_string(),
            })?;

        let message = ChatMessage {
            role: Role::Assistant,
            content: Content::Text(choice.message.content.unwrap_or_default()),
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
            tool_call_id: None,
            name: None,
        };

        Ok(ProviderResponse {
            id: parsed.id,
            model: if parsed.model.is_empty() { request.model } else { parsed.model },
            message,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: parsed.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            raw,
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = serde_json::to_value(&request).map_err(|e| ProviderError::Network(e.to_string()))?;
        body["stream"] = Value::Bool(true);
        body["stream_options"] = serde_json::json!({ "include_usage": true });

        debug!(provider = %self.name, model = %request.model, "dispatching streaming completion");

        let response = self
            .client
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(provider = %self.name, %status, "backend rejected streaming request");
            return Err(ProviderError::ApiError {
                status_code: status.as_u16(),
                message: text,
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut accumulators: HashMap<u32, ToolCallAccumulator> = HashMap::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::StreamInterrupted(e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        let _ = tx
                            .send(Ok(finalize_chunk(&accumulators, None, Value::Null)))
                            .await;
                        return;
                    }

                    match serde_json::from_str::<Value>(data) {
                        Ok(raw_chunk) => {
                            if let Some(out) = handle_event(&raw_chunk, &mut accumulators) {
                                if tx.send(Ok(out)).await.is_err() {
                                    return;
                                }
                            }
                            if let Some(usage) = raw_chunk.get("usage").and_then(parse_usage) {
                                let _ = tx.send(Ok(finalize_chunk(&accumulators, Some(usage), raw_chunk))).await;
                                return;
                            }
                        }
                        Err(e) => {
                            trace!(provider = %provider_name, %data, error = %e, "ignoring unparseable SSE chunk");
                        }
                    }
                }
            }

            let _ = tx.send(Ok(finalize_chunk(&accumulators, None, Value::Null))).await;
        });

        Ok(rx)
    }
}

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

fn parse_usage(value: &Value) -> Option<Usage> {
    if value.is_null() {
        return None;
    }
    Some(Usage {
        prompt_tokens: value.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: value.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: value.get("total_tokens")?.as_u64()? as u32,
    })
}

fn handle_event(raw_chunk: &Value, accumulators: &mut HashMap<u32, ToolCallAccumulator>) -> Option<StreamChunk> {
    let choice = raw_chunk.get("choices")?.as_array()?.first()?;
    let delta = choice.get("delta")?;

    if let Some(deltas) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for delta_call in deltas {
            let index = delta_call.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            let acc = accumulators.entry(index).or_default();
            if let Some(id) = delta_call.get("id").and_then(|v| v.as_str()) {
                acc.id = id.to_string();
            }
            if let Some(function) = delta_call.get("function") {
                if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                    acc.name = name.to_string();
                }
                if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                    acc.arguments.push_str(args);
                }
            }
        }
    }

    let content = delta.get("content").and_then(|v| v.as_str()).map(str::to_string);
    let has_content = content.as_ref().is_some_and(|c| !c.is_empty());
    let is_finish = choice.get("finish_reason").is_some_and(|v| !v.is_null());

    if has_content || is_finish {
        Some(StreamChunk {
            content,
            tool_call_deltas: Vec::new(),
            done: is_finish,
            usage: None,
            raw: raw_chunk.clone(),
        })
    } else {
        None
    }
}

fn finalize_chunk(accumulators: &HashMap<u32, ToolCallAccumulator>, usage: Option<Usage>, raw: Value) -> StreamChunk {
    let mut calls: Vec<(u32, &ToolCallAccumulator)> = accumulators.iter().map(|(k, v)| (*k, v)).collect();
    calls.sort_by_key(|(index, _)| *index);
    let tool_call_deltas = calls
        .into_iter()
        .map(|(_, acc)| ToolCall {
            id: acc.id.clone(),
            call_type: "function".to_string(),
            function: ToolCallFunction {
                name: acc.name.clone(),
                arguments: acc.arguments.clone(),
            },
        })
        .collect();

    StreamChunk {
        content: None,
        tool_call_deltas,
        done: true,
        usage,
        raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_usage_reads_openai_shape() {
        let value = serde_json::json!({"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15});
        let usage = parse_usage(&value).unwrap();
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn handle_event_extracts_content_delta() {
        let mut accumulators = HashMap::new();
        let raw = serde_json::json!({
            "choices": [{"delta": {"content": "hi"}, "finish_reason": null}]
        });
        let chunk = handle_event(&raw, &mut accumulators).unwrap();
        assert_eq!(chunk.content.as_deref(), Some("hi"));
        assert!(!chunk.done);
    }

    #[test]
    fn handle_event_accumulates_tool_call_arguments_across_deltas() {
        let mut accumulators = HashMap::new();
        let first = serde_json::json!({
            "choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call-1", "function": {"name": "execute_python", "arguments": "{\"code\":"}}]}, "finish_reason": null}]
        });
        let second = serde_json::json!({
            "choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "\"print(1)\"}"}}]}, "finish_reason": "tool_calls"}]
        });
        handle_event(&first, &mut accumulators);
        handle_event(&second, &mut accumulators);
        let finalized = finalize_chunk(&accumulators, None, Value::Null);
        assert_eq!(finalized.tool_call_deltas.len(), 1);
        assert_eq!(finalized.tool_call_deltas[0].function.arguments, "{\"code\":\"print(1)\"}");
    }
}
