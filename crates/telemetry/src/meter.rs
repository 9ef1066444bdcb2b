//! Credit-service client. The orchestrator opens a [`MeteringContext`]
//! before dispatching to the backend and closes it once usage is known;
//! docs-token requests use [`NoopMeter`] so documentation traffic never
//! touches the credit service.

use std::sync::Arc;

use async_trait::async_trait;
use attestgate_core::error::TelemetryError;
use serde::{Deserialize, Serialize};

/// Default estimated cost (in credit units) reserved before a response's
/// real usage is known.
pub const DEFAULT_ESTIMATED_COST: f64 = 2.0;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResponseUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub web_searches: u32,
}

#[async_trait]
pub trait CreditMeter: Send + Sync {
    /// Reserve `estimated_cost` credit units against `credit_id`, returning
    /// a meter-assigned transaction id. `is_public` mirrors the auth mode:
    /// `true` for capability-token requests charged to the subscription
    /// holder, `false` for opaque-credential requests.
    async fn start(&self, credit_id: &str, is_public: bool, estimated_cost: f64) -> Result<String, TelemetryError>;

    async fn set_response(&self, transaction_id: &str, usage: ResponseUsage) -> Result<(), TelemetryError>;
}

pub struct HttpCreditMeter {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl HttpCreditMeter {
    pub fn new(client: reqwest::Client, base_url: String, api_token: String) -> Self {
        Self {
            client,
            base_url,
            api_token,
        }
    }
}

#[derive(Serialize)]
struct StartRequest<'a> {
    credit_id: &'a str,
    is_public: bool,
    estimated_cost: f64,
}

#[derive(Deserialize)]
struct StartResponse {
    transaction_id: String,
}

#[async_trait]
impl CreditMeter for HttpCreditMeter {
    async fn start(&self, credit_id: &str, is_public: bool, estimated_cost: f64) -> Result<String, TelemetryError> {
        let response = self
            .client
            .post(format!("{}/charges", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&StartRequest {
                credit_id,
                is_public,
                estimated_cost,
            })
            .send()
            .await
            .map_err(|e| TelemetryError::CreditService(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TelemetryError::CreditService(format!(
                "credit service returned {}",
                response.status()
            )));
        }

        let parsed: StartResponse = response
            .json()
            .await
            .map_err(|e| TelemetryError::CreditService(e.to_string()))?;
        Ok(parsed.transaction_id)
    }

    async fn set_response(&self, transaction_id: &str, usage: ResponseUsage) -> Result<(), TelemetryError> {
        let response = self
            .client
            .post(format!("{}/charges/{transaction_id}/response", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "usage": usage }))
            .send()
            .await
            .map_err(|e| TelemetryError::CreditService(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TelemetryError::CreditService(format!(
                "credit service returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// A meter that never calls out — used for the docs-token bypass.
pub struct NoopMeter;

#[async_trait]
impl CreditMeter for NoopMeter {
    async fn start(&self, _credit_id: &str, _is_public: bool, _estimated_cost: f64) -> Result<String, TelemetryError> {
        Ok("noop".to_string())
    }

    async fn set_response(&self, _transaction_id: &str, _usage: ResponseUsage) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Per-request metering handle: opened before dispatch, closed once usage is
/// known. The orchestrator holds one of these for the lifetime of a request;
/// `Clone` lets the streaming path move a copy into its terminal-chunk
/// continuation without fighting the borrow checker.
#[derive(Clone)]
pub struct MeteringContext {
    meter: Arc<dyn CreditMeter>,
    transaction_id: String,
}

impl MeteringContext {
    pub async fn start(meter: Arc<dyn CreditMeter>, credit_id: &str, is_public: bool) -> Result<Self, TelemetryError> {
        let transaction_id = meter.start(credit_id, is_public, DEFAULT_ESTIMATED_COST).await?;
        Ok(Self { meter, transaction_id })
    }

    pub async fn set_response(&self, usage: ResponseUsage) -> Result<(), TelemetryError> {
        self.meter.set_response(&self.transaction_id, usage).await
    }
}
