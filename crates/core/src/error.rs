//! Error taxonomy for the gateway.
//!
//! Each bounded context gets its own `thiserror` enum; `GatewayError`
//! aggregates them and is the type the HTTP boundary maps to a status code.

use thiserror::Error;

/// The top-level error for the pipeline. Maps 1:1 onto the taxonomy in
/// the error-handling design: Unauthorized, Forbidden, BadRequest,
/// TooManyRequests, UpstreamFailure, Timeout, Internal.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    TooManyRequests { retry_after_ms: u64 },

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("request timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Unauthorized(_) => 401,
            GatewayError::Forbidden(_) => 403,
            GatewayError::BadRequest(_) => 400,
            GatewayError::TooManyRequests { .. } => 429,
            GatewayError::UpstreamFailure(_) => 500,
            GatewayError::Timeout => 504,
            GatewayError::Internal(_) => 500,
        }
    }
}

impl From<ProviderError> for GatewayError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Timeout(m) => GatewayError::Internal(format!("upstream timeout: {m}")),
            other => GatewayError::UpstreamFailure(other.to_string()),
        }
    }
}

impl From<CryptoError> for GatewayError {
    fn from(e: CryptoError) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

impl From<KvError> for GatewayError {
    fn from(e: KvError) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

impl From<RegistryError> for GatewayError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(m) => GatewayError::BadRequest(format!("unknown model: {m}")),
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl From<RateLimitError> for GatewayError {
    fn from(e: RateLimitError) -> Self {
        match e {
            RateLimitError::Exceeded { retry_after_ms } => {
                GatewayError::TooManyRequests { retry_after_ms }
            }
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl From<CapabilityError> for GatewayError {
    fn from(e: CapabilityError) -> Self {
        GatewayError::Unauthorized(e.to_string())
    }
}

impl From<AuthError> for GatewayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Forbidden(m) => GatewayError::Forbidden(m),
            other => GatewayError::Unauthorized(other.to_string()),
        }
    }
}

impl From<EnrichError> for GatewayError {
    fn from(e: EnrichError) -> Self {
        match e {
            EnrichError::DocumentAccessDenied(m) => GatewayError::Forbidden(m),
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl From<ToolLoopError> for GatewayError {
    fn from(e: ToolLoopError) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

impl From<TelemetryError> for GatewayError {
    fn from(e: TelemetryError) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("upstream returned {status_code}: {message}")]
    ApiError { status_code: u16, message: String },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to acquire keystore lock: {0}")]
    LockFailed(String),

    #[error("failed to read or write key material: {0}")]
    Io(#[from] std::io::Error),

    #[error("key material is corrupt: {0}")]
    CorruptKey(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("script evaluation failed: {0}")]
    Script(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model not registered: {0}")]
    NotFound(String),

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("lease refresh failed: {0}")]
    LeaseRefreshFailed(String),

    #[error(transparent)]
    Kv(#[from] KvError),
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    Exceeded { retry_after_ms: u64 },

    #[error(transparent)]
    Kv(#[from] KvError),
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("broken proof chain: {0}")]
    BrokenChain(String),

    #[error("token expired")]
    Expired,

    #[error("audience mismatch: expected {expected}, got {actual}")]
    AudienceMismatch { expected: String, actual: String },

    #[error("command is not an attenuation of the base command: {0}")]
    InvalidCommand(String),

    #[error("untrusted root issuer: {0}")]
    UntrustedIssuer(String),

    #[error("usage_limit is not an integer")]
    InvalidUsageLimitType,

    #[error("usage_limit {0} must be strictly positive")]
    NonPositiveUsageLimit(i64),

    #[error("usage_limit {current} is not a reduction of {previous}")]
    InconsistentUsageLimit { previous: i64, current: i64 },

    #[error("document owner DID {did} does not match issuer {issuer}")]
    DocumentOwnerMismatch { did: String, issuer: String },
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("credential rejected: {0}")]
    CredentialRejected(String),

    #[error("credit service error: {0}")]
    CreditService(String),

    #[error("forbidden: {0}")]
    Forbidden(String),
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("document access denied: {0}")]
    DocumentAccessDenied(String),

    #[error("vault request failed: {0}")]
    VaultRequestFailed(String),

    #[error("retrieval index request failed: {0}")]
    RetrievalFailed(String),

    #[error("web search failed: {0}")]
    WebSearchFailed(String),
}

#[derive(Debug, Error)]
pub enum ToolLoopError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("malformed tool call arguments: {0}")]
    MalformedArguments(String),
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("database error: {0}")]
    Database(String),

    #[error("credit service error: {0}")]
    CreditService(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(GatewayError::Unauthorized("x".into()).status_code(), 401);
        assert_eq!(GatewayError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(GatewayError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(
            GatewayError::TooManyRequests { retry_after_ms: 10 }.status_code(),
            429
        );
        assert_eq!(GatewayError::UpstreamFailure("x".into()).status_code(), 500);
        assert_eq!(GatewayError::Timeout.status_code(), 504);
    }

    #[test]
    fn rate_limit_error_converts_to_too_many_requests() {
        let e: GatewayError = RateLimitError::Exceeded {
            retry_after_ms: 2500,
        }
        .into();
        assert_eq!(e.status_code(), 429);
    }

    #[test]
    fn capability_error_converts_to_unauthorized() {
        let e: GatewayError = CapabilityError::Expired.into();
        assert_eq!(e.status_code(), 401);
    }
}
