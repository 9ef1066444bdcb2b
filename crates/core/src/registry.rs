//! Service-discovery domain types: the view of backend inference endpoints.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_multimodal: bool,
    #[serde(default)]
    pub features: Vec<String>,
}

/// A single announced backend instance, TTL-leased in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEndpoint {
    pub url: String,
    pub metadata: ModelMetadata,
}

impl ModelEndpoint {
    pub fn matches_name(&self, needle: &str) -> bool {
        self.metadata
            .name
            .to_lowercase()
            .contains(&needle.to_lowercase())
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.metadata.features.iter().any(|f| f == feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> ModelEndpoint {
        ModelEndpoint {
            url: "http://backend:8000".into(),
            metadata: ModelMetadata {
                id: "llama-3".into(),
                name: "Llama 3 70B".into(),
                version: "1.0".into(),
                supports_tools: true,
                supports_multimodal: false,
                features: vec!["chat".into()],
            },
        }
    }

    #[test]
    fn matches_name_is_case_insensitive() {
        assert!(endpoint().matches_name("llama"));
        assert!(endpoint().matches_name("LLAMA"));
        assert!(!endpoint().matches_name("mistral"));
    }

    #[test]
    fn has_feature_checks_exact() {
        assert!(endpoint().has_feature("chat"));
        assert!(!endpoint().has_feature("vision"));
    }
}
