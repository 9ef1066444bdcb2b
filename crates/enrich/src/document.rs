//! Stored-prompt injection: when the authenticated capability carries a
//! document binding, the bound document's `prompt` field is fetched from the
//! vault and prepended as a system message before any other enrichment runs.
//! Unlike nilrag and web search, failure here is never degraded gracefully —
//! a missing document, an owner mismatch, or a vault error all abort the
//! request with [`EnrichError::DocumentAccessDenied`].

use attestgate_core::capability::DocumentBinding;
use attestgate_core::error::EnrichError;
use attestgate_core::message::ChatRequest;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoredDocument {
    pub owner: String,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn fetch(&self, document_id: &str) -> Result<Option<StoredDocument>, EnrichError>;
}

pub struct HttpDocumentStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDocumentStore {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait::async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn fetch(&self, document_id: &str) -> Result<Option<StoredDocument>, EnrichError> {
        let response = self
            .client
            .get(format!("{}/documents/{document_id}", self.base_url))
            .send()
            .await
            .map_err(|e| EnrichError::DocumentAccessDenied(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(EnrichError::DocumentAccessDenied(format!(
                "vault returned {}",
                response.status()
            )));
        }
        let document: StoredDocument = response
            .json()
            .await
            .map_err(|e| EnrichError::DocumentAccessDenied(e.to_string()))?;
        Ok(Some(document))
    }
}

/// Fetch the bound document, verify ownership, and prepend its `prompt` as a
/// system message. Any missing field or mismatch is treated as a denial
/// rather than silently skipping the stage.
pub async fn handle_stored_prompt(
    req: &mut ChatRequest,
    binding: &DocumentBinding,
    store: &dyn DocumentStore,
) -> Result<(), EnrichError> {
    let document = store
        .fetch(&binding.document_id)
        .await?
        .ok_or_else(|| EnrichError::DocumentAccessDenied(format!("document {} not found", binding.document_id)))?;

    if document.owner != binding.document_owner_did {
        return Err(EnrichError::DocumentAccessDenied(format!(
            "document owner {} does not match binding owner {}",
            document.owner, binding.document_owner_did
        )));
    }

    let prompt = document
        .prompt
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| EnrichError::DocumentAccessDenied("document has no prompt".to_string()))?;

    crate::ensure_system_content(req, &prompt);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use attestgate_core::message::ChatMessage;

    struct StubStore {
        document: Option<StoredDocument>,
    }

    #[async_trait::async_trait]
    impl DocumentStore for StubStore {
        async fn fetch(&self, _document_id: &str) -> Result<Option<StoredDocument>, EnrichError> {
            Ok(self.document.clone())
        }
    }

    fn req() -> ChatRequest {
        ChatRequest {
            model: "model".to_string(),
            messages: vec![ChatMessage::user("summarize this")],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: false,
            tools: Vec::new(),
            tool_choice: None,
            web_search: None,
            nilrag: None,
        }
    }

    fn binding() -> DocumentBinding {
        DocumentBinding {
            document_id: "doc-1".to_string(),
            document_owner_did: "did:nil:owner".to_string(),
        }
    }

    #[tokio::test]
    async fn prepends_prompt_as_system_message() {
        let mut request = req();
        let store = StubStore {
            document: Some(StoredDocument {
                owner: "did:nil:owner".to_string(),
                prompt: Some("You are a contract summarizer.".to_string()),
            }),
        };
        handle_stored_prompt(&mut request, &binding(), &store).await.unwrap();
        assert!(matches!(request.messages[0].role, attestgate_core::message::Role::System));
    }

    #[tokio::test]
    async fn rejects_owner_mismatch() {
        let mut request = req();
        let store = StubStore {
            document: Some(StoredDocument {
                owner: "did:nil:someone-else".to_string(),
                prompt: Some("hello".to_string()),
            }),
        };
        let result = handle_stored_prompt(&mut request, &binding(), &store).await;
        assert!(matches!(result, Err(EnrichError::DocumentAccessDenied(_))));
    }

    #[tokio::test]
    async fn rejects_missing_document() {
        let mut request = req();
        let store = StubStore { document: None };
        let result = handle_stored_prompt(&mut request, &binding(), &store).await;
        assert!(matches!(result, Err(EnrichError::DocumentAccessDenied(_))));
    }

    #[tokio::test]
    async fn rejects_null_prompt() {
        let mut request = req();
        let store = StubStore {
            document: Some(StoredDocument {
                owner: "did:nil:owner".to_string(),
                prompt: None,
            }),
        };
        let result = handle_stored_prompt(&mut request, &binding(), &store).await;
        assert!(matches!(result, Err(EnrichError::DocumentAccessDenied(_))));
    }
}
