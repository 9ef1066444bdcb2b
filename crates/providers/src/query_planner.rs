//! Adapts the service registry into `attestgate_enrich`'s [`QueryPlanner`]
//! seam, used to turn a user's question into a short web search query before
//! the `web_search` enrichment stage fires.
//!
//! Query planning always targets the same backend the chat request itself
//! asked for — there's no separate "planner model" configured — so the
//! endpoint is resolved fresh from the registry on every call rather than
//! fixed at construction time.

use std::sync::Arc;

use attestgate_core::error::{EnrichError, ProviderError};
use attestgate_core::message::{ChatMessage, Content, Role};
use attestgate_core::provider::{Provider, ProviderRequest};
use attestgate_enrich::QueryPlanner;
use attestgate_registry::ModelRegistry;

use crate::OpenAiCompatProvider;

pub struct RegistryQueryPlanner {
    registry: Arc<ModelRegistry>,
    client: reqwest::Client,
}

impl RegistryQueryPlanner {
    pub fn new(registry: Arc<ModelRegistry>, client: reqwest::Client) -> Self {
        Self { registry, client }
    }
}

#[async_trait::async_trait]
impl QueryPlanner for RegistryQueryPlanner {
    async fn complete_text(&self, system: &str, user: &str, model: &str) -> Result<String, EnrichError> {
        let endpoint = self
            .registry
            .discover(Some(model), None)
            .await
            .map_err(|e| EnrichError::WebSearchFailed(format!("no backend for model {model}: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| EnrichError::WebSearchFailed(format!("no backend registered for model {model}")))?;

        let provider = OpenAiCompatProvider::for_endpoint(model, endpoint.url, self.client.clone());

        let request = ProviderRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: Content::Text(system.to_string()),
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                    name: None,
                },
                ChatMessage {
                    role: Role::User,
                    content: Content::Text(user.to_string()),
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                    name: None,
                },
            ],
            temperature: None,
            top_p: None,
            max_tokens: Some(600),
            tools: Vec::new(),
            tool_choice: None,
            stream: false,
        };

        let response = provider.complete(request).await.map_err(provider_error_to_enrich)?;
        Ok(response.message.content.extract_text())
    }
}

fn provider_error_to_enrich(err: ProviderError) -> EnrichError {
    EnrichError::WebSearchFailed(format!("query planner backend: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use attestgate_core::provider::{ProviderResponse, StreamChunk};

    struct StubProvider(&'static str);

    #[async_trait::async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse {
                id: "stub-1".to_string(),
                model: request.model,
                message: ChatMessage {
                    role: Role::Assistant,
                    content: Content::Text(self.0.to_string()),
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                    name: None,
                },
                finish_reason: "stop".to_string(),
                usage: None,
                raw: serde_json::Value::Null,
            })
        }

        async fn stream(
            &self,
            _request: ProviderRequest,
        ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
            unimplemented!("query planner never streams")
        }
    }

    #[tokio::test]
    async fn extracts_plain_text_from_stub_backend() {
        let planner = StubProvider("best rust async runtimes");
        let request = ProviderRequest {
            model: "m".to_string(),
            messages: Vec::new(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            tools: Vec::new(),
            tool_choice: None,
            stream: false,
        };
        let response = planner.complete(request).await.unwrap();
        assert_eq!(response.message.content.extract_text(), "best rust async runtimes");
    }
}
