//! Request enrichment: injects web search context and nilDB-retrieved
//! document context into a chat request's system message before it reaches
//! the orchestrator.

pub mod document;
pub mod nilrag;
pub mod web_search;

pub use document::{handle_stored_prompt, DocumentStore, HttpDocumentStore, StoredDocument};
pub use nilrag::{handle_nilrag, HttpVaultClient, NilragRequestOptions, VaultClient, VaultNode};
pub use web_search::{handle_web_search, BraveSearchProvider, SearchProvider, WebSearchConfig};

use attestgate_core::message::{ChatRequest, Source};

/// Shared outcome of any enrichment stage: the (possibly mutated) messages
/// plus the sources that were consulted, surfaced back to the caller for
/// attribution in the response envelope.
pub struct EnrichedMessages {
    pub sources: Vec<Source>,
}

/// An LLM completion used internally to plan search queries, abstracted so
/// `attestgate-enrich` doesn't depend on `attestgate-providers` directly.
#[async_trait::async_trait]
pub trait QueryPlanner: Send + Sync {
    async fn complete_text(&self, system: &str, user: &str, model: &str) -> Result<String, attestgate_core::error::EnrichError>;
}

pub(crate) fn ensure_system_content(req: &mut ChatRequest, extra: &str) {
    attestgate_core::message::ensure_system_content(&mut req.messages, extra);
}
