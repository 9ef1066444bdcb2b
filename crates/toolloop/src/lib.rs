//! Executes at most one tool-calling follow-up round after an upstream
//! completion. Extracts tool calls from either the structured `tool_calls`
//! field or, failing that, a handful of JSON-in-text shapes some backends
//! emit instead, routes each to a registered [`Tool`], and re-dispatches the
//! conversation with `tool_choice: "none"` so the model can't keep chaining.

use std::collections::HashMap;
use std::sync::Arc;

use attestgate_core::error::{ProviderError, ToolLoopError};
use attestgate_core::message::{ChatMessage, ToolCall};
use attestgate_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use serde::Deserialize;
use serde_json::Value;

/// A single callable tool. Only one concrete implementation ships in this
/// crate (`execute_python`, backed by an external sandbox); the registry
/// exists so more can be added without touching the orchestrator.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, arguments: &str) -> Result<String, ToolLoopError>;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }
}

/// Sends `code` to an external Python sandbox over HTTP and returns stdout.
/// The sandbox itself is an out-of-scope collaborator; this is just the
/// client seam.
pub struct ExecutePythonTool {
    client: reqwest::Client,
    sandbox_url: String,
}

impl ExecutePythonTool {
    pub fn new(client: reqwest::Client, sandbox_url: String) -> Self {
        Self { client, sandbox_url }
    }
}

#[derive(Deserialize)]
struct PythonArguments {
    code: String,
}

#[derive(Deserialize)]
struct SandboxResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait::async_trait]
impl Tool for ExecutePythonTool {
    fn name(&self) -> &str {
        "execute_python"
    }

    async fn execute(&self, arguments: &str) -> Result<String, ToolLoopError> {
        let parsed: PythonArguments = serde_json::from_str(arguments)
            .map_err(|e| ToolLoopError::MalformedArguments(e.to_string()))?;

        let response = self
            .client
            .post(format!("{}/execute", self.sandbox_url))
            .json(&serde_json::json!({ "code": parsed.code }))
            .send()
            .await
            .map_err(|e| ToolLoopError::ExecutionFailed {
                tool_name: self.name().to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ToolLoopError::ExecutionFailed {
                tool_name: self.name().to_string(),
                reason: format!("sandbox returned {}", response.status()),
            });
        }

        let parsed: SandboxResponse = response.json().await.map_err(|e| ToolLoopError::ExecutionFailed {
            tool_name: self.name().to_string(),
            reason: e.to_string(),
        })?;

        if let Some(error) = parsed.error {
            return Err(ToolLoopError::ExecutionFailed {
                tool_name: self.name().to_string(),
                reason: error,
            });
        }

        Ok(parsed.stdout)
    }
}

#[derive(Deserialize)]
struct FunctionShape {
    function: InnerFunction,
}

#[derive(Deserialize)]
struct InnerFunction {
    name: String,
    #[serde(default)]
    parameters: Value,
}

#[derive(Deserialize)]
struct NameArgumentsShape {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct ToolShape {
    tool: String,
    #[serde(flatten)]
    rest: Value,
}

/// Pulls tool calls off a completion: prefer the structured `tool_calls`
/// field; otherwise try parsing the assistant's text content as one of three
/// JSON shapes some backends use instead of structured calls.
pub fn extract_tool_calls(message: &ChatMessage) -> Vec<ToolCall> {
    if !message.tool_calls.is_empty() {
        return message.tool_calls.clone();
    }

    let text = message.content.extract_text();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if let Ok(shape) = serde_json::from_str::<FunctionShape>(trimmed) {
        return vec![synthetic_call(&shape.function.name, &shape.function.parameters)];
    }
    if let Ok(shape) = serde_json::from_str::<NameArgumentsShape>(trimmed) {
        return vec![synthetic_call(&shape.name, &shape.arguments)];
    }
    if let Ok(shape) = serde_json::from_str::<ToolShape>(trimmed) {
        return vec![synthetic_call(&shape.tool, &shape.rest)];
    }
    Vec::new()
}

fn synthetic_call(name: &str, arguments: &Value) -> ToolCall {
    use attestgate_core::message::ToolCallFunction;
    ToolCall {
        id: attestgate_core::message::new_request_id(),
        call_type: "function".to_string(),
        function: ToolCallFunction {
            name: name.to_string(),
            arguments: arguments.to_string(),
        },
    }
}

/// Runs a single tool round on top of an already-completed upstream
/// response. Returns the follow-up completion and the summed usage across
/// both rounds, or the original response unchanged if it carried no tool
/// calls.
pub async fn run_tool_loop(
    initial: ProviderResponse,
    mut request: ProviderRequest,
    provider: &dyn Provider,
    registry: &ToolRegistry,
) -> Result<(ProviderResponse, Usage), ProviderError> {
    let tool_calls = extract_tool_calls(&initial.message);
    let initial_usage = initial.usage.unwrap_or_default();

    if tool_calls.is_empty() {
        return Ok((initial, initial_usage));
    }

    let mut assistant_message = initial.message.clone();
    assistant_message.tool_calls = tool_calls.clone();
    request.messages.push(assistant_message);

    for call in &tool_calls {
        let result = match registry.get(&call.function.name) {
            Some(tool) => tool
                .execute(&call.function.arguments)
                .await
                .unwrap_or_else(|e| format!("error: {e}")),
            None => format!("error: unknown tool \"{}\"", call.function.name),
        };
        request.messages.push(ChatMessage::tool_result(call.id.clone(), result));
    }

    request.tool_choice = Some(Value::String("none".to_string()));
    let follow_up = provider.complete(request).await?;

    let mut total_usage = initial_usage;
    total_usage.add(&follow_up.usage.unwrap_or_default());

    Ok((follow_up, total_usage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use attestgate_core::message::{Content, Role};

    fn response_with_calls(calls: Vec<ToolCall>) -> ProviderResponse {
        ProviderResponse {
            id: "resp-1".to_string(),
            model: "m".to_string(),
            message: ChatMessage {
                role: Role::Assistant,
                content: Content::Text(String::new()),
                tool_calls: calls,
                tool_call_id: None,
                name: None,
            },
            finish_reason: "tool_calls".to_string(),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            raw: Value::Null,
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "m".to_string(),
            messages: vec![ChatMessage::user("compute 6*7")],
            temperature: None,
            top_p: None,
            max_tokens: None,
            tools: Vec::new(),
            tool_choice: None,
            stream: false,
        }
    }

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "execute_python"
        }
        async fn execute(&self, _arguments: &str) -> Result<String, ToolLoopError> {
            Ok("42".to_string())
        }
    }

    struct StubProvider;

    #[async_trait::async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }
        async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse {
                id: "resp-2".to_string(),
                model: "m".to_string(),
                message: ChatMessage::assistant("the answer is 42"),
                finish_reason: "stop".to_string(),
                usage: Some(Usage {
                    prompt_tokens: 20,
                    completion_tokens: 8,
                    total_tokens: 28,
                }),
                raw: Value::Null,
            })
        }
    }

    #[test]
    fn extract_tool_calls_prefers_structured_field() {
        let call = ToolCall {
            id: "call-1".to_string(),
            call_type: "function".to_string(),
            function: attestgate_core::message::ToolCallFunction {
                name: "execute_python".to_string(),
                arguments: "{\"code\":\"print(6*7)\"}".to_string(),
            },
        };
        let message = response_with_calls(vec![call]).message;
        assert_eq!(extract_tool_calls(&message).len(), 1);
    }

    #[test]
    fn extract_tool_calls_falls_back_to_json_text() {
        let message = ChatMessage::assistant("{\"name\":\"execute_python\",\"arguments\":{\"code\":\"print(1)\"}}");
        let calls = extract_tool_calls(&message);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "execute_python");
    }

    #[tokio::test]
    async fn runs_one_round_and_sums_usage() {
        let call = ToolCall {
            id: "call-1".to_string(),
            call_type: "function".to_string(),
            function: attestgate_core::message::ToolCallFunction {
                name: "execute_python".to_string(),
                arguments: "{\"code\":\"print(6*7)\"}".to_string(),
            },
        };
        let initial = response_with_calls(vec![call]);
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let (final_response, usage) = run_tool_loop(initial, request(), &StubProvider, &registry)
            .await
            .unwrap();

        assert!(final_response.message.content.extract_text().contains("42"));
        assert_eq!(usage.prompt_tokens, 30);
        assert_eq!(usage.completion_tokens, 13);
        assert_eq!(usage.total_tokens, 43);
    }

    #[tokio::test]
    async fn no_tool_calls_returns_original_untouched() {
        let initial = response_with_calls(vec![]);
        let registry = ToolRegistry::new();
        let (final_response, usage) = run_tool_loop(initial, request(), &StubProvider, &registry)
            .await
            .unwrap();
        assert_eq!(final_response.id, "resp-1");
        assert_eq!(usage.total_tokens, 15);
    }
}
