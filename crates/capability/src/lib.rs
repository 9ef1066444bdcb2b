//! Validates a capability token's full delegation chain: the root grant,
//! each attenuating proof, and the final invocation.
//!
//! A chain is accepted only if every node is unexpired, the invocation's
//! audience matches this service, the root issuer is trusted (when a
//! trusted-issuer allowlist is configured), the invocation command is an
//! attenuation of the base command namespace, and any `usage_limit` carried
//! in node metadata only ever shrinks as the chain is walked from root to
//! invocation.

use attestgate_core::capability::{
    is_reduction_of, CapabilityToken, DocumentBinding, RateLimitAttenuation, TokenNode,
};
use attestgate_core::error::CapabilityError;
use attestgate_core::message::now;

pub mod parser;
pub use parser::{issue_delegation_token, parse_token};

pub const BASE_COMMAND: &str = "/nil/ai";

pub struct ValidationParams<'a> {
    /// The gateway's own DID, which every invocation must name as audience.
    pub expected_audience: &'a str,
    /// DIDs trusted as root issuers. Empty means any root issuer is
    /// accepted — users are free to issue their own root tokens, charged
    /// back to the subscription holder named as the root's subject.
    pub trusted_root_issuers: &'a [String],
}

pub struct ValidatedChain {
    pub usage_limits: Vec<RateLimitAttenuation>,
    pub document_binding: Option<DocumentBinding>,
}

/// Walk root -> proofs -> invocation, checking expiry, audience, issuer
/// trust, command namespace, and usage-limit monotonicity along the way.
pub fn validate_chain(
    token: &CapabilityToken,
    params: &ValidationParams,
) -> Result<ValidatedChain, CapabilityError> {
    if !token.invocation.command.starts_with(BASE_COMMAND) {
        return Err(CapabilityError::InvalidCommand(token.invocation.command.clone()));
    }

    if token.invocation.audience.did() != params.expected_audience {
        return Err(CapabilityError::AudienceMismatch {
            expected: params.expected_audience.to_string(),
            actual: token.invocation.audience.did(),
        });
    }

    if !params.trusted_root_issuers.is_empty()
        && !params
            .trusted_root_issuers
            .iter()
            .any(|issuer| issuer == &token.root.issuer.did())
    {
        return Err(CapabilityError::UntrustedIssuer(token.root.issuer.did()));
    }

    let now = now();
    for node in full_chain(token) {
        if node.expires_at < now {
            return Err(CapabilityError::Expired);
        }
    }

    let usage_limits = collect_usage_limits(token)?;
    let document_binding = find_document_binding(token)?;

    Ok(ValidatedChain {
        usage_limits,
        document_binding,
    })
}

fn full_chain(token: &CapabilityToken) -> impl Iterator<Item = &TokenNode> {
    std::iter::once(&token.root)
        .chain(token.proofs.iter())
        .chain(std::iter::once(&token.invocation))
}

/// Collect `usage_limit` metadata from root -> leaf proofs, requiring each
/// subsequent limit to be a reduction of the one before it. The invocation's
/// own `usage_limit` (if any) is never consulted — only proofs count.
fn collect_usage_limits(token: &CapabilityToken) -> Result<Vec<RateLimitAttenuation>, CapabilityError> {
    let mut limits: Vec<RateLimitAttenuation> = Vec::new();

    for node in std::iter::once(&token.root).chain(token.proofs_root_to_leaf()) {
        let Some(value) = node.usage_limit() else {
            continue;
        };
        let usage_limit = value.as_i64().ok_or(CapabilityError::InvalidUsageLimitType)?;
        match limits.last().map(|l| l.usage_limit) {
            Some(previous) => {
                if !is_reduction_of(previous, usage_limit) {
                    return Err(CapabilityError::InconsistentUsageLimit {
                        previous,
                        current: usage_limit,
                    });
                }
            }
            None if usage_limit <= 0 => {
                return Err(CapabilityError::NonPositiveUsageLimit(usage_limit));
            }
            None => {}
        }
        limits.push(RateLimitAttenuation {
            signature: node.signature.clone(),
            expires_at: node.expires_at,
            usage_limit,
        });
    }
    Ok(limits)
}

/// Find the uppermost (closest to root) node carrying a document binding,
/// validating that its declared owner DID matches the node's own issuer.
fn find_document_binding(token: &CapabilityToken) -> Result<Option<DocumentBinding>, CapabilityError> {
    for node in std::iter::once(&token.root).chain(token.proofs_root_to_leaf()) {
        let (Some(document_id), Some(owner_did)) = (node.document_id(), node.document_owner_did())
        else {
            continue;
        };
        if owner_did != node.issuer.did() {
            return Err(CapabilityError::DocumentOwnerMismatch {
                did: owner_did.to_string(),
                issuer: node.issuer.did(),
            });
        }
        return Ok(Some(DocumentBinding {
            document_id: document_id.to_string(),
            document_owner_did: owner_did.to_string(),
        }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use attestgate_core::capability::Principal;
    use chrono::Duration;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn principal(key: &str) -> Principal {
        Principal {
            public_key: key.to_string(),
        }
    }

    fn node(issuer: &str, audience: &str, command: &str, expires_in_secs: i64) -> TokenNode {
        TokenNode {
            issuer: principal(issuer),
            audience: principal(audience),
            subject: principal(issuer),
            command: command.to_string(),
            expires_at: now() + Duration::seconds(expires_in_secs),
            meta: BTreeMap::new(),
            signature: format!("sig-{issuer}"),
        }
    }

    fn chain() -> CapabilityToken {
        CapabilityToken {
            root: node("root-key", "gateway", "/nil/ai", 3600),
            proofs: vec![],
            invocation: node("leaf-key", "gateway", "/nil/ai/chat/completions", 3600),
        }
    }

    fn params(expected_audience: &str) -> ValidationParams<'_> {
        ValidationParams {
            expected_audience,
            trusted_root_issuers: &[],
        }
    }

    #[test]
    fn accepts_a_well_formed_chain() {
        let audience = principal("gateway").did();
        assert!(validate_chain(&chain(), &params(&audience)).is_ok());
    }

    #[test]
    fn rejects_audience_mismatch() {
        let audience = principal("someone-else").did();
        let result = validate_chain(&chain(), &params(&audience));
        assert!(matches!(result, Err(CapabilityError::AudienceMismatch { .. })));
    }

    #[test]
    fn rejects_untrusted_root_issuer() {
        let audience = principal("gateway").did();
        let params = ValidationParams {
            expected_audience: &audience,
            trusted_root_issuers: &["did:nil:someone-trusted".to_string()],
        };
        let result = validate_chain(&chain(), &params);
        assert!(matches!(result, Err(CapabilityError::UntrustedIssuer(_))));
    }

    #[test]
    fn rejects_expired_nodes() {
        let mut token = chain();
        token.root = node("root-key", "gateway", "/nil/ai", -10);
        let audience = principal("gateway").did();
        assert!(matches!(
            validate_chain(&token, &params(&audience)),
            Err(CapabilityError::Expired)
        ));
    }

    #[test]
    fn rejects_commands_outside_the_base_namespace() {
        let mut token = chain();
        token.invocation = node("leaf-key", "gateway", "/nil/other", 3600);
        let audience = principal("gateway").did();
        assert!(matches!(
            validate_chain(&token, &params(&audience)),
            Err(CapabilityError::InvalidCommand(_))
        ));
    }

    #[test]
    fn usage_limit_must_shrink_monotonically() {
        let mut root = node("root-key", "gateway", "/nil/ai", 3600);
        root.meta.insert("usage_limit".to_string(), json!(100));
        let mut proof = node("mid-key", "gateway", "/nil/ai", 3600);
        proof.meta.insert("usage_limit".to_string(), json!(200));

        let token = CapabilityToken {
            root,
            proofs: vec![proof],
            invocation: node("leaf-key", "gateway", "/nil/ai/chat/completions", 3600),
        };
        let audience = principal("gateway").did();
        assert!(matches!(
            validate_chain(&token, &params(&audience)),
            Err(CapabilityError::InconsistentUsageLimit { .. })
        ));
    }

    #[test]
    fn root_usage_limit_must_be_strictly_positive() {
        let mut root = node("root-key", "gateway", "/nil/ai", 3600);
        root.meta.insert("usage_limit".to_string(), json!(-5));

        let token = CapabilityToken {
            root,
            proofs: vec![],
            invocation: node("leaf-key", "gateway", "/nil/ai/chat/completions", 3600),
        };
        let audience = principal("gateway").did();
        assert!(matches!(
            validate_chain(&token, &params(&audience)),
            Err(CapabilityError::NonPositiveUsageLimit(-5))
        ));
    }

    #[test]
    fn document_binding_requires_owner_to_match_issuer() {
        let mut root = node("root-key", "gateway", "/nil/ai", 3600);
        root.meta.insert("document_id".to_string(), json!("doc-1"));
        root.meta
            .insert("document_owner_did".to_string(), json!("did:nil:someone-else"));

        let token = CapabilityToken {
            root,
            proofs: vec![],
            invocation: node("leaf-key", "gateway", "/nil/ai/chat/completions", 3600),
        };
        let audience = principal("gateway").did();
        assert!(matches!(
            validate_chain(&token, &params(&audience)),
            Err(CapabilityError::DocumentOwnerMismatch { .. })
        ));
    }
}
