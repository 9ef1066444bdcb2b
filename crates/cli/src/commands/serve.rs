//! `attestgate serve` — the boot sequencer.
//!
//! Startup order: load config → open KV → open DB (migrating if
//! `--auto-migrate`) → initialize registry → load keystore → assemble
//! application state → start the HTTP server. A `ctrl_c` handler unregisters
//! any locally-owned service registrations before the process exits.

use std::sync::Arc;

use attestgate_auth::{ApiKeyStrategy, AuthStrategy, DocsTokenBypass, NucStrategy};
use attestgate_core::capability::Principal;
use attestgate_core::config::{AppConfig, AuthStrategyKind};
use attestgate_core::error::AuthError;
use attestgate_core::registry::ModelEndpoint;
use attestgate_crypto::{default_key_path, Keystore};
use attestgate_enrich::{VaultNode, WebSearchConfig as EnrichWebSearchConfig};
use attestgate_gateway::AppState;
use attestgate_kv::redis_store::RedisKvStore;
use attestgate_kv::KvStore;
use attestgate_providers::RegistryQueryPlanner;
use attestgate_ratelimit::{RateLimiter, WebSearchConfig as RateLimitWebSearchConfig};
use attestgate_registry::ModelRegistry;
use attestgate_telemetry::{HttpCreditMeter, SqlxQueryLogStore, SqlxUserRepository};
use attestgate_toolloop::{ExecutePythonTool, ToolRegistry};
use tracing::info;

pub async fn run(auto_migrate: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    info!(?config, "configuration loaded");

    let kv: Arc<dyn KvStore> = Arc::new(RedisKvStore::connect(&config.kv.url).await?);

    let db_pool = SqlxQueryLogStore::connect(&config.database.dsn).await?;
    if auto_migrate {
        SqlxQueryLogStore::migrate(&db_pool).await?;
        info!("database migrations applied");
    }
    let query_log = Arc::new(SqlxQueryLogStore::new(db_pool.clone()));

    let registry = Arc::new(ModelRegistry::new(kv.clone(), config.registry.lease_ttl_secs));
    let locally_owned = register_static_models(&registry).await?;
    spawn_lease_refresh(registry.clone(), locally_owned.clone());

    let keystore = Arc::new(Keystore::load_or_generate(&default_key_path())?);
    let gateway_did = Principal {
        public_key: hex_from_base64(&keystore.public_key_base64()),
    }
    .did();

    let rate_limiter = Arc::new(RateLimiter::new(
        kv.clone(),
        RateLimitWebSearchConfig {
            rps: config.rate_limiting.web_search_rps,
            max_concurrent_requests: config.rate_limiting.max_concurrent_requests,
            max_topics: config.rate_limiting.web_search_max_topics,
        },
    ));

    let http_client = reqwest::Client::new();
    let user_repository = Arc::new(SqlxUserRepository::new(db_pool));

    let auth: Arc<dyn AuthStrategy> = match &config.auth.strategy {
        AuthStrategyKind::Nuc => {
            let strategy = NucStrategy::new(
                user_repository.clone(),
                gateway_did,
                config.auth.trusted_root_issuers.clone(),
                |raw| attestgate_capability::parse_token(raw).map_err(AuthError::from),
            );
            Arc::new(DocsTokenBypass::new(
                config.auth.docs_token.clone(),
                user_repository,
                strategy,
            ))
        }
        AuthStrategyKind::ApiKey => {
            let strategy = ApiKeyStrategy::new(user_repository.clone());
            Arc::new(DocsTokenBypass::new(
                config.auth.docs_token.clone(),
                user_repository,
                strategy,
            ))
        }
    };

    let document_store_url =
        std::env::var("ATTESTGATE_DOCUMENT_STORE_URL").unwrap_or_else(|_| "http://127.0.0.1:9091".to_string());
    let document_store = Arc::new(attestgate_enrich::HttpDocumentStore::new(
        http_client.clone(),
        document_store_url,
    ));
    let vault_client = Arc::new(attestgate_enrich::HttpVaultClient::new(http_client.clone()));
    let vault_nodes = load_vault_nodes()?;

    let query_planner = Arc::new(RegistryQueryPlanner::new(registry.clone(), http_client.clone()));
    let search_provider = Arc::new(attestgate_enrich::BraveSearchProvider::new(
        http_client.clone(),
        EnrichWebSearchConfig {
            api_key: std::env::var("ATTESTGATE_BRAVE_API_KEY").unwrap_or_default(),
            api_base: std::env::var("ATTESTGATE_BRAVE_API_BASE")
                .unwrap_or_else(|_| "https://api.search.brave.com/res/v1/web/search".to_string()),
            count: std::env::var("ATTESTGATE_BRAVE_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            country: std::env::var("ATTESTGATE_BRAVE_COUNTRY").unwrap_or_else(|_| "us".to_string()),
            lang: std::env::var("ATTESTGATE_BRAVE_LANG").unwrap_or_else(|_| "en".to_string()),
        },
    ));

    let mut tools = ToolRegistry::new();
    let sandbox_url =
        std::env::var("ATTESTGATE_SANDBOX_URL").unwrap_or_else(|_| "http://127.0.0.1:9092".to_string());
    tools.register(Arc::new(ExecutePythonTool::new(http_client.clone(), sandbox_url)));

    let credit_meter: Arc<dyn attestgate_telemetry::CreditMeter> = Arc::new(HttpCreditMeter::new(
        http_client.clone(),
        config.credit.base_url.clone(),
        config.credit.api_token.clone().unwrap_or_default(),
    ));

    let attester_url =
        std::env::var("ATTESTGATE_ATTESTER_URL").unwrap_or_else(|_| "http://nilcc-attester".to_string());
    let attestation = Arc::new(attestgate_gateway::attestation::HttpAttestationProvider::new(
        http_client.clone(),
        attester_url,
    ));

    let state = Arc::new(AppState {
        config,
        keystore,
        registry: registry.clone(),
        rate_limiter,
        auth,
        document_store,
        vault_client,
        vault_nodes,
        query_planner,
        search_provider,
        tools: Arc::new(tools),
        credit_meter,
        query_log,
        attestation,
        http_client,
        started_at: std::time::Instant::now(),
    });

    let shutdown_registry = registry;
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, unregistering local service leases");
        for endpoint in &locally_owned {
            if let Err(e) = shutdown_registry.unregister(&endpoint.metadata.id).await {
                tracing::warn!(model_id = %endpoint.metadata.id, error = %e, "failed to unregister model lease on shutdown");
            }
        }
        std::process::exit(0);
    });

    attestgate_gateway::start(state).await
}

/// Any inference backends this process itself owns (rather than backends
/// registering independently), configured via `ATTESTGATE_STATIC_MODELS` as a
/// JSON array of `ModelEndpoint`. Returns the endpoints registered, so the
/// refresh loop and the shutdown handler can act on exactly the leases this
/// process took out.
async fn register_static_models(registry: &ModelRegistry) -> Result<Vec<ModelEndpoint>, Box<dyn std::error::Error>> {
    let Ok(raw) = std::env::var("ATTESTGATE_STATIC_MODELS") else {
        return Ok(Vec::new());
    };
    let endpoints: Vec<ModelEndpoint> = serde_json::from_str(&raw)?;
    for endpoint in &endpoints {
        registry.register(endpoint).await?;
    }
    Ok(endpoints)
}

/// The single background task that owns lease refresh (§9's shared-resource
/// note): every `refresh_interval` (`L/2`), re-registers each locally-owned
/// endpoint to renew its TTL. On a transport error, retries with exponential
/// backoff (multiplier 1, min 4s, max 10s, up to 3 attempts) before giving up
/// on that cycle and trying again at the next interval — a lease is never
/// dropped quietly, only logged as unhealthy.
fn spawn_lease_refresh(registry: Arc<ModelRegistry>, endpoints: Vec<ModelEndpoint>) {
    if endpoints.is_empty() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(registry.refresh_interval());
        ticker.tick().await; // first tick fires immediately; skip it, register() already primed the lease
        loop {
            ticker.tick().await;
            for endpoint in &endpoints {
                if let Err(e) = refresh_with_backoff(&registry, endpoint).await {
                    tracing::warn!(
                        model_id = %endpoint.metadata.id,
                        error = %e,
                        "lease refresh unhealthy after exhausting retries, will retry next interval"
                    );
                }
            }
        }
    });
}

const REFRESH_BACKOFF_MULTIPLIER: u32 = 1;
const REFRESH_BACKOFF_MIN_SECS: u64 = 4;
const REFRESH_BACKOFF_MAX_SECS: u64 = 10;
const REFRESH_BACKOFF_MAX_ATTEMPTS: u32 = 3;

async fn refresh_with_backoff(
    registry: &ModelRegistry,
    endpoint: &ModelEndpoint,
) -> Result<(), attestgate_core::error::RegistryError> {
    let mut last_err = None;
    for attempt in 0..REFRESH_BACKOFF_MAX_ATTEMPTS {
        match registry.refresh_lease(endpoint).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(model_id = %endpoint.metadata.id, attempt, error = %e, "lease refresh failed, retrying");
                last_err = Some(e);
                if attempt + 1 < REFRESH_BACKOFF_MAX_ATTEMPTS {
                    let delay_secs = REFRESH_BACKOFF_MIN_SECS
                        .saturating_mul(u64::from(REFRESH_BACKOFF_MULTIPLIER.pow(attempt)))
                        .min(REFRESH_BACKOFF_MAX_SECS);
                    tokio::time::sleep(std::time::Duration::from_secs(delay_secs)).await;
                }
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

fn load_vault_nodes() -> Result<Vec<VaultNode>, Box<dyn std::error::Error>> {
    match std::env::var("ATTESTGATE_NILRAG_NODES") {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(_) => Ok(Vec::new()),
    }
}

fn hex_from_base64(b64: &str) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD
        .decode(b64)
        .map(|bytes| bytes.iter().map(|b| format!("{b:02x}")).collect())
        .unwrap_or_default()
}
