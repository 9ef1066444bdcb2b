//! nilDB-backed retrieval augmentation: fetches the top-matching chunks for
//! the user's query from a set of nilDB nodes and appends them to the
//! system message as extra context.

use attestgate_core::error::EnrichError;
use attestgate_core::message::ChatRequest;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct VaultNode {
    pub url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub schema_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RetrievedChunk {
    pub distance: f32,
    pub text: String,
}

#[async_trait::async_trait]
pub trait VaultClient: Send + Sync {
    /// Retrieve the `num_chunks` closest chunks to `query` across `nodes`.
    async fn top_chunks(
        &self,
        nodes: &[VaultNode],
        query: &str,
        num_chunks: u32,
    ) -> Result<Vec<RetrievedChunk>, EnrichError>;
}

pub struct HttpVaultClient {
    client: reqwest::Client,
}

impl HttpVaultClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
    num_chunks: u32,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<RawChunk>,
}

#[derive(Deserialize)]
struct RawChunk {
    distance: f32,
    text: String,
}

#[async_trait::async_trait]
impl VaultClient for HttpVaultClient {
    async fn top_chunks(
        &self,
        nodes: &[VaultNode],
        query: &str,
        num_chunks: u32,
    ) -> Result<Vec<RetrievedChunk>, EnrichError> {
        let mut all = Vec::new();
        for node in nodes {
            let mut request = self.client.post(format!("{}/query", node.url)).json(&QueryRequest {
                query,
                num_chunks,
            });
            if let Some(token) = &node.bearer_token {
                request = request.bearer_auth(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| EnrichError::VaultRequestFailed(e.to_string()))?;
            if !response.status().is_success() {
                return Err(EnrichError::VaultRequestFailed(format!(
                    "node {} returned {}",
                    node.url,
                    response.status()
                )));
            }
            let parsed: QueryResponse = response
                .json()
                .await
                .map_err(|e| EnrichError::VaultRequestFailed(e.to_string()))?;
            all.extend(parsed.results.into_iter().map(|c| RetrievedChunk {
                distance: c.distance,
                text: c.text,
            }));
        }
        all.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        all.truncate(num_chunks as usize);
        Ok(all)
    }
}

#[derive(Deserialize)]
pub struct NilragRequestOptions {
    pub nodes: Vec<VaultNode>,
    #[serde(default = "default_num_chunks")]
    pub num_chunks: u32,
}

fn default_num_chunks() -> u32 {
    2
}

/// Retrieve context chunks for the request's last user query and append
/// them to the system message. The request must carry `nilrag.nodes` or
/// this returns `RetrievalFailed`; an empty user query is likewise an error
/// since there is nothing to retrieve against.
pub async fn handle_nilrag(
    req: &mut ChatRequest,
    options: &NilragRequestOptions,
    vault: &dyn VaultClient,
) -> Result<(), EnrichError> {
    if options.nodes.is_empty() {
        return Err(EnrichError::RetrievalFailed(
            "nilrag configuration is missing or invalid".to_string(),
        ));
    }

    let query = req
        .last_user_text()
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| EnrichError::RetrievalFailed("no user query found".to_string()))?;

    let chunks = vault.top_chunks(&options.nodes, &query, options.num_chunks).await?;

    let formatted = chunks
        .iter()
        .map(|c| format!("- ({:.4}) {}", c.distance, c.text))
        .collect::<Vec<_>>()
        .join("\n");
    let relevant_context = format!("\n\nRelevant Context:\n{formatted}");

    crate::ensure_system_content(req, &relevant_context);
    Ok(())
}
