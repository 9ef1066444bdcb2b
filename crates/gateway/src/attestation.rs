//! Client for the node's confidential-computing attester, consulted by
//! `GET /v1/attestation/report`. The attester runs as a co-located sidecar;
//! its response is opaque blobs this service never inspects beyond pulling
//! the two fields the response envelope names.

use attestgate_core::error::EnrichError;
use serde::Deserialize;

#[async_trait::async_trait]
pub trait AttestationProvider: Send + Sync {
    async fn report(&self) -> Result<AttestationBlobs, EnrichError>;
}

pub struct AttestationBlobs {
    pub gpu_attestation: String,
    pub cpu_attestation: String,
}

#[derive(Deserialize)]
struct AttesterResponse {
    report: String,
    gpu_token: String,
}

pub struct HttpAttestationProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAttestationProvider {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait::async_trait]
impl AttestationProvider for HttpAttestationProvider {
    async fn report(&self) -> Result<AttestationBlobs, EnrichError> {
        let response = self
            .client
            .get(format!("{}/v2/report", self.base_url))
            .send()
            .await
            .map_err(|e| EnrichError::RetrievalFailed(format!("attester request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EnrichError::RetrievalFailed(format!(
                "attester returned {}",
                response.status()
            )));
        }

        let parsed: AttesterResponse = response
            .json()
            .await
            .map_err(|e| EnrichError::RetrievalFailed(format!("malformed attester response: {e}")))?;

        Ok(AttestationBlobs {
            gpu_attestation: parsed.report,
            cpu_attestation: parsed.gpu_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProvider;

    #[async_trait::async_trait]
    impl AttestationProvider for StubProvider {
        async fn report(&self) -> Result<AttestationBlobs, EnrichError> {
            Ok(AttestationBlobs {
                gpu_attestation: "gpu".to_string(),
                cpu_attestation: "cpu".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn stub_provider_returns_blobs() {
        let report = StubProvider.report().await.unwrap();
        assert_eq!(report.gpu_attestation, "gpu");
        assert_eq!(report.cpu_attestation, "cpu");
    }
}
