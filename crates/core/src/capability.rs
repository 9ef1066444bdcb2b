//! Capability token chain data model.
//!
//! A token is a root invocation-authorization chain: a root node, zero or
//! more delegation proofs, and a leaf invocation. Parsing and cryptographic
//! validation live in `attestgate-capability`; this module holds the shapes
//! every consuming crate (auth, rate-limit, enrich) needs to agree on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A public-key principal, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub public_key: String,
}

impl Principal {
    pub fn did(&self) -> String {
        format!("did:nil:{}", self.public_key)
    }

    pub fn from_did(did: &str) -> Option<Self> {
        did.strip_prefix("did:nil:").map(|pk| Principal {
            public_key: pk.to_string(),
        })
    }
}

/// One decoded node of the chain: the root, a proof, or the invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenNode {
    pub issuer: Principal,
    pub audience: Principal,
    pub subject: Principal,
    /// Hierarchical command path, e.g. "/nil/ai/chat".
    pub command: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
    /// Hex-encoded signature over the canonical encoding of this node.
    pub signature: String,
}

impl TokenNode {
    pub fn usage_limit(&self) -> Option<&serde_json::Value> {
        self.meta.get("usage_limit")
    }

    pub fn document_id(&self) -> Option<&str> {
        self.meta.get("document_id").and_then(|v| v.as_str())
    }

    pub fn document_owner_did(&self) -> Option<&str> {
        self.meta
            .get("document_owner_did")
            .and_then(|v| v.as_str())
    }
}

/// A fully decoded chain: root, intermediate proofs (root-to-leaf order is
/// the reverse of how they are serialized on the wire), and the invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub root: TokenNode,
    /// Stored leaf-to-root, matching the wire encoding; callers that need
    /// root-to-leaf order (usage-limit/document-binding extraction) must
    /// iterate in reverse.
    pub proofs: Vec<TokenNode>,
    pub invocation: TokenNode,
}

impl CapabilityToken {
    /// Proofs in root-to-leaf order, for monotonicity / binding extraction.
    pub fn proofs_root_to_leaf(&self) -> impl Iterator<Item = &TokenNode> {
        self.proofs.iter().rev()
    }

    pub fn subscription_holder(&self) -> &Principal {
        &self.root.subject
    }

    pub fn issuing_user(&self) -> &Principal {
        &self.root.issuer
    }
}

/// A single extracted rate-limit attenuation from one proof in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitAttenuation {
    pub signature: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub usage_limit: i64,
}

impl RateLimitAttenuation {
    pub fn ms_remaining(&self) -> i64 {
        (self.expires_at - chrono::Utc::now())
            .num_milliseconds()
            .max(0)
    }
}

/// The document binding extracted from the first proof (root-ward) that
/// carries both `document_id` and `document_owner_did`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentBinding {
    pub document_id: String,
    pub document_owner_did: String,
}

/// Whether `reduced` is a valid attenuation of `base`: `0 < reduced <= base`.
pub fn is_reduction_of(base: i64, reduced: i64) -> bool {
    reduced > 0 && reduced <= base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_did_round_trip() {
        let p = Principal {
            public_key: "abc123".into(),
        };
        let did = p.did();
        assert_eq!(did, "did:nil:abc123");
        assert_eq!(Principal::from_did(&did), Some(p));
    }

    #[test]
    fn is_reduction_of_boundaries() {
        assert!(is_reduction_of(100, 100));
        assert!(is_reduction_of(100, 1));
        assert!(!is_reduction_of(100, 0));
        assert!(!is_reduction_of(100, 101));
        assert!(!is_reduction_of(100, -5));
    }
}
