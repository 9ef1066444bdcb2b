//! HTTP API gateway: wires every bounded-context crate into the
//! `POST /v1/chat/completions` orchestrator and its surrounding HTTP surface.
//!
//! Built on Axum, following the teacher's middleware-stacking style: plain
//! `tower`/`tower_http` layers for the generic concerns (CORS, timeout, body
//! limit) and `middleware::from_fn` for the gateway-specific ones (security
//! headers, request metrics, bearer auth).

pub mod attestation;
pub mod chat;
pub mod error;
pub mod handlers;
pub mod middleware_stack;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::info;

pub use state::AppState;

type SharedState = Arc<AppState>;

/// Build the full router: protected `/v1/*` routes behind bearer auth, the
/// two auth-exempt `/v1/*` routes, and the top-level liveness/readiness
/// probes — then the middleware stack, outermost layer last (§4.9: CORS
/// wraps everything; security-headers, request-metrics, request-timeout,
/// request-size-limit follow in that order).
pub fn build_router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/usage", get(handlers::usage))
        .route("/v1/attestation/report", get(handlers::attestation_report))
        .route("/v1/delegation", get(handlers::delegation))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware_stack::auth_middleware,
        ));

    let public = Router::new()
        .route("/v1/public_key", get(handlers::public_key))
        .route("/v1/health", get(handlers::health))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz));

    let size_limit = state.config.server.request_size_limit_bytes as usize;
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let cors = build_cors(&state.config.cors.allowed_origins);

    protected
        .merge(public)
        .with_state(state)
        .layer(axum::extract::DefaultBodyLimit::max(size_limit))
        .layer(TimeoutLayer::new(timeout))
        .layer(axum::middleware::from_fn(middleware_stack::request_metrics_middleware))
        .layer(axum::middleware::from_fn(middleware_stack::security_headers_middleware))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Never falls back to a wildcard; an empty allow-list means no cross-origin
/// request is ever permitted, matching `AppConfig::validate`'s refusal to
/// boot a non-loopback server without an explicit list.
fn build_cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<axum::http::HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ])
        .max_age(Duration::from_secs(3600))
}

/// Bind and serve. Caller (the CLI's `serve` subcommand) is responsible for
/// the rest of the boot sequence — config, KV, DB, registry, keystore — and
/// passes in the fully assembled [`AppState`].
pub async fn start(state: SharedState) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let app = build_router(state);

    info!(%addr, "gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
