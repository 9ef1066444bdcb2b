//! Decodes a bearer string into a [`CapabilityToken`] and verifies every
//! node's signature before handing the chain to [`crate::validate_chain`].
//!
//! Wire format: `<node>.<proof-1>.<proof-2>...<root>`, i.e. the invocation
//! first, its proofs leaf-to-root, and the root node last — matching
//! [`CapabilityToken`]'s own leaf-to-root storage order for `proofs`. Each
//! segment is base64url (no padding) of the node's canonical JSON encoding,
//! `signature` field included. A node signs over the canonical encoding of
//! itself with `signature` fixed to the empty string; `issuer.public_key`
//! (hex) is the verifying key for that signature, read off the same node it
//! signs — delegation proofs are counter-signed by their own issuer, not the
//! node above them.

use attestgate_core::capability::{CapabilityToken, TokenNode};
use attestgate_core::error::CapabilityError;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;

/// Parse and cryptographically verify a bearer string into a full chain.
///
/// Does not perform audience/expiry/usage-limit checks — that is
/// [`crate::validate_chain`]'s job once the chain is structurally and
/// cryptographically sound.
pub fn parse_token(bearer: &str) -> Result<CapabilityToken, CapabilityError> {
    let segments: Vec<&str> = bearer.split('.').collect();
    if segments.len() < 2 {
        return Err(CapabilityError::Malformed(
            "token must have an invocation and at least a root segment".into(),
        ));
    }

    let mut nodes = Vec::with_capacity(segments.len());
    for segment in &segments {
        nodes.push(decode_node(segment)?);
    }

    for node in &nodes {
        verify_node_signature(node)?;
    }

    let invocation = nodes.remove(0);
    let root = nodes.pop().ok_or_else(|| {
        CapabilityError::Malformed("token must have a root segment distinct from the invocation".into())
    })?;
    let proofs = nodes;

    let token = CapabilityToken { root, proofs, invocation };
    check_chain_linkage(&token)?;
    Ok(token)
}

fn decode_node(segment: &str) -> Result<TokenNode, CapabilityError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| CapabilityError::Malformed(format!("invalid base64 segment: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| CapabilityError::Malformed(format!("invalid node JSON: {e}")))
}

/// A node's signature covers its own canonical encoding with `signature`
/// blanked out, signed by its own issuer key.
fn verify_node_signature(node: &TokenNode) -> Result<(), CapabilityError> {
    let mut unsigned = node.clone();
    unsigned.signature = String::new();
    let encoded = serde_json::to_value(&unsigned)
        .map_err(|e| CapabilityError::Malformed(format!("could not encode node: {e}")))?;
    let canonical = attestgate_crypto::canonicalize(&encoded);

    let public_key_b64 = hex_to_base64(&node.issuer.public_key)
        .map_err(|e| CapabilityError::Malformed(format!("invalid issuer public key: {e}")))?;
    let signature_b64 = hex_to_base64(&node.signature)
        .map_err(|e| CapabilityError::Malformed(format!("invalid signature encoding: {e}")))?;

    let ok = attestgate_crypto::Keystore::verify(&public_key_b64, canonical.as_bytes(), &signature_b64)
        .map_err(|e| CapabilityError::BrokenChain(format!("signature verification failed: {e}")))?;
    if !ok {
        return Err(CapabilityError::BrokenChain(format!(
            "signature invalid for issuer {}",
            node.issuer.did()
        )));
    }
    Ok(())
}

/// Each proof must be delegated by the principal the node above it (closer
/// to the root) named as audience, and each must, in turn, name the next
/// node's issuer as its own audience — a continuous issuer/audience walk
/// from root to invocation.
fn check_chain_linkage(token: &CapabilityToken) -> Result<(), CapabilityError> {
    let chain: Vec<&TokenNode> = std::iter::once(&token.root)
        .chain(token.proofs_root_to_leaf())
        .chain(std::iter::once(&token.invocation))
        .collect();

    for pair in chain.windows(2) {
        let (parent, child) = (pair[0], pair[1]);
        if parent.audience.public_key != child.issuer.public_key {
            return Err(CapabilityError::BrokenChain(format!(
                "audience {} does not match next issuer {}",
                parent.audience.did(),
                child.issuer.did()
            )));
        }
    }
    Ok(())
}

/// Mint a single-segment chain (root == invocation) signed by this
/// service's own key — backs the short-lived delegation tokens
/// `GET /v1/delegation` hands out so a document owner can write on the
/// service's behalf. Not meant to be presented back to this service's own
/// `validate_chain` — it is proof of authorization for an external
/// collaborator that speaks the same wire format.
pub fn issue_delegation_token(
    keystore: &attestgate_crypto::Keystore,
    audience_did: &str,
    command: &str,
    ttl_secs: i64,
) -> Result<String, CapabilityError> {
    use attestgate_core::capability::Principal;
    use std::collections::BTreeMap;

    let issuer = Principal {
        public_key: base64_to_hex(&keystore.public_key_base64()),
    };
    let subject = Principal::from_did(audience_did)
        .ok_or_else(|| CapabilityError::Malformed(format!("invalid audience DID: {audience_did}")))?;

    let mut node = TokenNode {
        issuer,
        audience: subject.clone(),
        subject,
        command: command.to_string(),
        expires_at: attestgate_core::message::now() + chrono::Duration::seconds(ttl_secs),
        meta: BTreeMap::new(),
        signature: String::new(),
    };
    let encoded = serde_json::to_value(&node).map_err(|e| CapabilityError::Malformed(e.to_string()))?;
    let canonical = attestgate_crypto::canonicalize(&encoded);
    let sig_b64 = keystore
        .sign(canonical.as_bytes())
        .map_err(|e| CapabilityError::Malformed(e.to_string()))?;
    node.signature = base64_to_hex(&sig_b64);

    let bytes = serde_json::to_vec(&node).map_err(|e| CapabilityError::Malformed(e.to_string()))?;
    let segment = URL_SAFE_NO_PAD.encode(bytes);
    Ok(format!("{segment}.{segment}"))
}

fn base64_to_hex(b64: &str) -> String {
    let bytes = STANDARD.decode(b64).unwrap_or_default();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_to_base64(hex: &str) -> Result<String, String> {
    if hex.len() % 2 != 0 {
        return Err("odd-length hex string".into());
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect::<Result<Vec<u8>, String>>()?;
    Ok(STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use attestgate_core::capability::Principal;
    use attestgate_core::message::now;
    use attestgate_crypto::Keystore;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    static KEY_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn fresh_keystore() -> Keystore {
        let n = KEY_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!("attestgate-capability-test-{}-{n}.key", std::process::id()));
        let _ = std::fs::remove_file(&path);
        Keystore::load_or_generate(&path).unwrap()
    }

    fn signed_node(
        signer: &Keystore,
        issuer_hex: &str,
        audience: &Principal,
        command: &str,
    ) -> TokenNode {
        let mut node = TokenNode {
            issuer: Principal {
                public_key: issuer_hex.to_string(),
            },
            audience: audience.clone(),
            subject: Principal {
                public_key: issuer_hex.to_string(),
            },
            command: command.to_string(),
            expires_at: now() + Duration::seconds(3600),
            meta: BTreeMap::new(),
            signature: String::new(),
        };
        let encoded = serde_json::to_value(&node).unwrap();
        let canonical = attestgate_crypto::canonicalize(&encoded);
        let sig_b64 = signer.sign(canonical.as_bytes()).unwrap();
        node.signature = base64_to_hex(&sig_b64);
        node
    }

    fn base64_to_hex(b64: &str) -> String {
        let bytes = STANDARD.decode(b64).unwrap();
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn key_hex(keystore: &Keystore) -> String {
        let bytes = STANDARD.decode(keystore.public_key_base64()).unwrap();
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn encode_segment(node: &TokenNode) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(node).unwrap())
    }

    #[test]
    fn round_trips_a_single_node_chain() {
        let root_key = fresh_keystore();
        let root_hex = key_hex(&root_key);
        let gateway = Principal {
            public_key: "gateway-key".to_string(),
        };
        let root = signed_node(&root_key, &root_hex, &gateway, "/nil/ai");

        let bearer = format!("{}.{}", encode_segment(&root), encode_segment(&root));
        let token = parse_token(&bearer).unwrap();
        assert_eq!(token.root.issuer.public_key, root_hex);
        assert_eq!(token.invocation.issuer.public_key, root_hex);
    }

    #[test]
    fn rejects_tampered_signature() {
        let root_key = fresh_keystore();
        let root_hex = key_hex(&root_key);
        let gateway = Principal {
            public_key: "gateway-key".to_string(),
        };
        let mut root = signed_node(&root_key, &root_hex, &gateway, "/nil/ai");
        root.command = "/nil/ai/tampered".to_string();

        let bearer = format!("{}.{}", encode_segment(&root), encode_segment(&root));
        let result = parse_token(&bearer);
        assert!(matches!(result, Err(CapabilityError::BrokenChain(_))));
    }

    #[test]
    fn rejects_malformed_base64() {
        let result = parse_token("not-valid-base64!!.also-not");
        assert!(matches!(result, Err(CapabilityError::Malformed(_))));
    }

    #[test]
    fn rejects_single_segment_token() {
        let root_key = fresh_keystore();
        let root_hex = key_hex(&root_key);
        let gateway = Principal {
            public_key: "gateway-key".to_string(),
        };
        let root = signed_node(&root_key, &root_hex, &gateway, "/nil/ai");
        let result = parse_token(&encode_segment(&root));
        assert!(matches!(result, Err(CapabilityError::Malformed(_))));
    }

    #[test]
    fn rejects_broken_issuer_audience_linkage() {
        let root_key = fresh_keystore();
        let root_hex = key_hex(&root_key);
        let leaf_key = fresh_keystore();
        let leaf_hex = key_hex(&leaf_key);
        let gateway = Principal {
            public_key: "gateway-key".to_string(),
        };
        let root = signed_node(&root_key, &root_hex, &gateway, "/nil/ai");
        // invocation's issuer is leaf-key, but root's audience is "gateway-key" not leaf-key
        let invocation = signed_node(&leaf_key, &leaf_hex, &gateway, "/nil/ai/chat/completions");

        let bearer = format!("{}.{}", encode_segment(&invocation), encode_segment(&root));
        let result = parse_token(&bearer);
        assert!(matches!(result, Err(CapabilityError::BrokenChain(_))));
    }
}
