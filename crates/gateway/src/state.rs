//! Shared application state, assembled once at boot and handed to every
//! handler behind an `Arc`.

use std::sync::Arc;

use attestgate_auth::AuthStrategy;
use attestgate_core::config::AppConfig;
use attestgate_crypto::Keystore;
use attestgate_enrich::{DocumentStore, QueryPlanner, SearchProvider, VaultClient, VaultNode};
use attestgate_ratelimit::RateLimiter;
use attestgate_registry::ModelRegistry;
use attestgate_telemetry::{CreditMeter, SqlxQueryLogStore};
use attestgate_toolloop::ToolRegistry;

use crate::attestation::AttestationProvider;

pub struct AppState {
    pub config: AppConfig,
    pub keystore: Arc<Keystore>,
    pub registry: Arc<ModelRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub auth: Arc<dyn AuthStrategy>,
    pub document_store: Arc<dyn DocumentStore>,
    pub vault_client: Arc<dyn VaultClient>,
    /// nilDB cluster topology for retrieval-augmented requests. Unlike the
    /// rest of the ambient stack this has no home in `AppConfig` (§4.10 does
    /// not enumerate it) — loaded separately from `ATTESTGATE_NILRAG_NODES`
    /// by the CLI's boot sequencer. An empty list degrades `nilrag` requests
    /// gracefully rather than failing the boot.
    pub vault_nodes: Vec<VaultNode>,
    pub query_planner: Arc<dyn QueryPlanner>,
    pub search_provider: Arc<dyn SearchProvider>,
    pub tools: Arc<ToolRegistry>,
    pub credit_meter: Arc<dyn CreditMeter>,
    pub query_log: Arc<SqlxQueryLogStore>,
    pub attestation: Arc<dyn AttestationProvider>,
    pub http_client: reqwest::Client,
    pub started_at: std::time::Instant,
}
