//! Model endpoint discovery: backends register themselves under
//! `models/{id}` with a TTL lease and refresh it on an interval; the
//! gateway discovers and filters candidates by scanning that prefix.

use std::sync::Arc;
use std::time::Duration;

use attestgate_core::error::RegistryError;
use attestgate_core::registry::{ModelEndpoint, ModelMetadata};
use attestgate_kv::KvStore;

const KEY_PREFIX: &str = "models/";

pub struct ModelRegistry {
    kv: Arc<dyn KvStore>,
    lease_ttl_secs: u64,
}

impl ModelRegistry {
    pub fn new(kv: Arc<dyn KvStore>, lease_ttl_secs: u64) -> Self {
        Self { kv, lease_ttl_secs }
    }

    fn key_for(model_id: &str) -> String {
        format!("{KEY_PREFIX}{model_id}")
    }

    pub async fn register(&self, endpoint: &ModelEndpoint) -> Result<String, RegistryError> {
        let key = Self::key_for(&endpoint.metadata.id);
        let value = serde_json::to_string(endpoint)
            .map_err(|e| RegistryError::RegistrationFailed(e.to_string()))?;
        self.kv.set_with_ttl(&key, &value, self.lease_ttl_secs).await?;
        Ok(key)
    }

    pub async fn unregister(&self, model_id: &str) -> Result<(), RegistryError> {
        self.kv.delete(&Self::key_for(model_id)).await?;
        Ok(())
    }

    pub async fn get(&self, model_id: &str) -> Result<Option<ModelEndpoint>, RegistryError> {
        let raw = self.kv.get(&Self::key_for(model_id)).await?;
        match raw {
            Some(json) => {
                let endpoint = serde_json::from_str(&json)
                    .map_err(|e| RegistryError::RegistrationFailed(e.to_string()))?;
                Ok(Some(endpoint))
            }
            None => Ok(None),
        }
    }

    /// Scan every live lease and filter by optional name substring and
    /// required feature. Entries that fail to parse are skipped and logged
    /// rather than failing the whole discovery pass.
    pub async fn discover(
        &self,
        name: Option<&str>,
        feature: Option<&str>,
    ) -> Result<Vec<ModelEndpoint>, RegistryError> {
        let keys = self.kv.scan_prefix(KEY_PREFIX).await?;
        let mut found = Vec::new();
        for key in keys {
            let value = match self.kv.get(&key).await? {
                Some(v) => v,
                None => continue,
            };
            let endpoint: ModelEndpoint = match serde_json::from_str(&value) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(%key, error = %e, "failed to parse registry entry");
                    continue;
                }
            };
            if let Some(needle) = name {
                if !endpoint.matches_name(needle) {
                    continue;
                }
            }
            if let Some(feature) = feature {
                if !endpoint.has_feature(feature) {
                    continue;
                }
            }
            found.push(endpoint);
        }
        Ok(found)
    }

    /// Refresh the lease once. Callers drive this on an interval of
    /// `lease_ttl_secs / 2`, matching the margin the original discovery
    /// client used to avoid letting a lease lapse mid-refresh.
    pub async fn refresh_lease(&self, endpoint: &ModelEndpoint) -> Result<(), RegistryError> {
        self.register(endpoint).await.map(|_| ())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs / 2)
    }
}

pub fn sample_metadata(id: impl Into<String>, name: impl Into<String>) -> ModelMetadata {
    ModelMetadata {
        id: id.into(),
        name: name.into(),
        version: "1.0.0".to_string(),
        supports_tools: false,
        supports_multimodal: false,
        features: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attestgate_kv::FakeKvStore;

    fn endpoint(id: &str, name: &str, features: &[&str]) -> ModelEndpoint {
        let mut metadata = sample_metadata(id, name);
        metadata.features = features.iter().map(|f| f.to_string()).collect();
        ModelEndpoint {
            url: format!("http://backend/{id}"),
            metadata,
        }
    }

    #[tokio::test]
    async fn register_then_get_round_trip() {
        let registry = ModelRegistry::new(Arc::new(FakeKvStore::new()), 60);
        let ep = endpoint("llama-70b", "Llama 70B", &["tools"]);
        registry.register(&ep).await.unwrap();

        let fetched = registry.get("llama-70b").await.unwrap().unwrap();
        assert_eq!(fetched.metadata.name, "Llama 70B");
    }

    #[tokio::test]
    async fn discover_filters_by_name_and_feature() {
        let registry = ModelRegistry::new(Arc::new(FakeKvStore::new()), 60);
        registry
            .register(&endpoint("a", "Vision Model", &["multimodal"]))
            .await
            .unwrap();
        registry
            .register(&endpoint("b", "Text Model", &["tools"]))
            .await
            .unwrap();

        let by_name = registry.discover(Some("vision"), None).await.unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].metadata.id, "a");

        let by_feature = registry.discover(None, Some("tools")).await.unwrap();
        assert_eq!(by_feature.len(), 1);
        assert_eq!(by_feature[0].metadata.id, "b");
    }

    #[tokio::test]
    async fn unregister_removes_the_lease() {
        let registry = ModelRegistry::new(Arc::new(FakeKvStore::new()), 60);
        registry.register(&endpoint("a", "A", &[])).await.unwrap();
        registry.unregister("a").await.unwrap();
        assert!(registry.get("a").await.unwrap().is_none());
    }
}
