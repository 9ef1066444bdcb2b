//! The supporting `/v1/*` endpoints and the liveness/readiness probes from
//! §6: model discovery, usage totals, attestation, delegation, the public
//! key, and health checks.

use attestgate_auth::AuthenticationInfo;
use attestgate_core::error::GatewayError;
use attestgate_core::registry::ModelMetadata;
use attestgate_telemetry::QueryLogStore;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::SharedState;

pub async fn list_models(State(state): State<SharedState>) -> Result<Json<Vec<ModelMetadata>>, ApiError> {
    let endpoints = state.registry.discover(None, None).await.map_err(GatewayError::from)?;
    Ok(Json(endpoints.into_iter().map(|e| e.metadata).collect()))
}

#[derive(Serialize)]
pub struct UsageResponse {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

pub async fn usage(
    State(state): State<SharedState>,
    Extension(auth_info): Extension<AuthenticationInfo>,
) -> Result<Json<UsageResponse>, ApiError> {
    let totals = state
        .query_log
        .usage_totals(&auth_info.user.user_id)
        .await
        .map_err(GatewayError::from)?;
    Ok(Json(UsageResponse {
        prompt_tokens: totals.prompt_tokens,
        completion_tokens: totals.completion_tokens,
        total_tokens: totals.total_tokens,
    }))
}

#[derive(Serialize)]
pub struct AttestationResponse {
    pub verifying_key: String,
    pub cpu_attestation: String,
    pub gpu_attestation: String,
}

pub async fn attestation_report(State(state): State<SharedState>) -> Result<Json<AttestationResponse>, ApiError> {
    let report = state.attestation.report().await.map_err(GatewayError::from)?;
    Ok(Json(AttestationResponse {
        verifying_key: state.keystore.public_key_base64(),
        cpu_attestation: report.cpu_attestation,
        gpu_attestation: report.gpu_attestation,
    }))
}

/// Short-lived grant letting `prompt_delegation_request` write a prompt
/// document on this service's behalf — 60s TTL, mirroring the nilDB
/// delegation pattern's `into_seconds_from_now(60)`.
const DELEGATION_TTL_SECS: i64 = 60;
const DELEGATION_COMMAND: &str = "/nil/db/data/create";

#[derive(Deserialize)]
pub struct DelegationQuery {
    pub prompt_delegation_request: String,
}

#[derive(Serialize)]
pub struct DelegationResponse {
    pub token: String,
    pub did: String,
}

pub async fn delegation(
    State(state): State<SharedState>,
    Query(query): Query<DelegationQuery>,
) -> Result<Json<DelegationResponse>, ApiError> {
    let token = attestgate_capability::issue_delegation_token(
        &state.keystore,
        &query.prompt_delegation_request,
        DELEGATION_COMMAND,
        DELEGATION_TTL_SECS,
    )
    .map_err(GatewayError::from)?;
    let did = attestgate_core::capability::Principal {
        public_key: hex_from_base64(&state.keystore.public_key_base64()),
    }
    .did();
    Ok(Json(DelegationResponse { token, did }))
}

fn hex_from_base64(b64: &str) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD
        .decode(b64)
        .map(|bytes| bytes.iter().map(|b| format!("{b:02x}")).collect())
        .unwrap_or_default()
}

pub async fn public_key(State(state): State<SharedState>) -> String {
    state.keystore.public_key_base64()
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime: String,
}

pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime: format!("{}s", state.started_at.elapsed().as_secs()),
    })
}

pub async fn healthz(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        uptime: format!("{}s", state.started_at.elapsed().as_secs()),
    })
}

#[derive(Serialize)]
struct ReadyChecks {
    registry: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: ReadyChecks,
}

/// Unlike `/healthz`, this touches the registry — an empty endpoint set
/// means the service has nothing to route to and should be pulled from a
/// load balancer's rotation even though the process itself is alive.
pub async fn readyz(State(state): State<SharedState>) -> Response {
    let registry_check = match state.registry.discover(None, None).await {
        Ok(endpoints) if !endpoints.is_empty() => Ok(()),
        Ok(_) => Err("no endpoints registered"),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed to reach the registry");
            Err("unreachable")
        }
    };

    match registry_check {
        Ok(()) => Json(ReadyResponse {
            status: "ready",
            checks: ReadyChecks { registry: "ok" },
        })
        .into_response(),
        Err(reason) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not_ready",
                checks: ReadyChecks { registry: reason },
            }),
        )
            .into_response(),
    }
}
