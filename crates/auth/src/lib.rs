//! Authentication strategies: API key and capability token, both converging
//! on the same [`AuthenticationInfo`] shape so the rest of the gateway never
//! needs to know which one admitted a request.

use async_trait::async_trait;
use attestgate_capability::{validate_chain, ValidationParams};
use attestgate_core::capability::{CapabilityToken, DocumentBinding, RateLimitAttenuation};
use attestgate_core::error::AuthError;
use attestgate_core::user::User;

/// Storage seam for user records, implemented against the persistence layer.
/// Mirrors the lookup-or-create pattern every strategy needs: a NUC's
/// issuing user may be seen for the first time and provisioned on the spot.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<User>, AuthError>;
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<User>, AuthError>;
    async fn insert(&self, user: &User) -> Result<(), AuthError>;
}

#[derive(Debug, Clone)]
pub struct AuthenticationInfo {
    pub user: User,
    pub token_rate_limits: Vec<RateLimitAttenuation>,
    pub prompt_document: Option<DocumentBinding>,
    /// Whether this request authenticated via capability token (NUC) rather
    /// than an opaque credential — the orchestrator meters capability-mode
    /// requests against the subscription holder with `is_public=true`.
    pub is_capability: bool,
    /// Set only by [`DocsTokenBypass`]; the orchestrator skips the credit
    /// service entirely for these requests.
    pub bypass_metering: bool,
}

#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<AuthenticationInfo, AuthError>;
}

/// A fixed docs token that always admits, provisioning a user record named
/// after the token itself on first use. Lets API documentation tooling probe
/// the service without a real credential.
pub struct DocsTokenBypass<S: AuthStrategy> {
    docs_token: Option<String>,
    repository: std::sync::Arc<dyn UserRepository>,
    inner: S,
}

impl<S: AuthStrategy> DocsTokenBypass<S> {
    pub fn new(docs_token: Option<String>, repository: std::sync::Arc<dyn UserRepository>, inner: S) -> Self {
        Self {
            docs_token,
            repository,
            inner,
        }
    }
}

#[async_trait]
impl<S: AuthStrategy> AuthStrategy for DocsTokenBypass<S> {
    async fn authenticate(&self, credential: &str) -> Result<AuthenticationInfo, AuthError> {
        if let Some(token) = &self.docs_token {
            if token == credential {
                let user = match self.repository.find_by_user_id(credential).await? {
                    Some(user) => user,
                    None => {
                        let user = User::new(credential.to_string());
                        self.repository.insert(&user).await?;
                        user
                    }
                };
                return Ok(AuthenticationInfo {
                    user,
                    token_rate_limits: Vec::new(),
                    prompt_document: None,
                    is_capability: false,
                    bypass_metering: true,
                });
            }
        }
        self.inner.authenticate(credential).await
    }
}

pub struct ApiKeyStrategy {
    repository: std::sync::Arc<dyn UserRepository>,
}

impl ApiKeyStrategy {
    pub fn new(repository: std::sync::Arc<dyn UserRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl AuthStrategy for ApiKeyStrategy {
    async fn authenticate(&self, api_key: &str) -> Result<AuthenticationInfo, AuthError> {
        match self.repository.find_by_api_key(api_key).await? {
            Some(user) => Ok(AuthenticationInfo {
                user,
                token_rate_limits: Vec::new(),
                prompt_document: None,
                is_capability: false,
                bypass_metering: false,
            }),
            None => Err(AuthError::CredentialRejected(
                "missing or invalid API key".to_string(),
            )),
        }
    }
}

pub struct NucStrategy {
    repository: std::sync::Arc<dyn UserRepository>,
    expected_audience: String,
    trusted_root_issuers: Vec<String>,
    parser: Box<dyn Fn(&str) -> Result<CapabilityToken, AuthError> + Send + Sync>,
}

impl NucStrategy {
    pub fn new(
        repository: std::sync::Arc<dyn UserRepository>,
        expected_audience: String,
        trusted_root_issuers: Vec<String>,
        parser: impl Fn(&str) -> Result<CapabilityToken, AuthError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            repository,
            expected_audience,
            trusted_root_issuers,
            parser: Box::new(parser),
        }
    }
}

#[async_trait]
impl AuthStrategy for NucStrategy {
    async fn authenticate(&self, nuc_token: &str) -> Result<AuthenticationInfo, AuthError> {
        let token = (self.parser)(nuc_token)?;
        let params = ValidationParams {
            expected_audience: &self.expected_audience,
            trusted_root_issuers: &self.trusted_root_issuers,
        };
        let validated = validate_chain(&token, &params)?;

        // Rate limits accrue to the user issuing the NUC, but the
        // subscription they draw down belongs to the root's subject.
        let user_id = token.issuing_user().did();
        let user = match self.repository.find_by_user_id(&user_id).await? {
            Some(user) => user,
            None => {
                let user = User::new(user_id);
                self.repository.insert(&user).await?;
                user
            }
        };

        Ok(AuthenticationInfo {
            user,
            token_rate_limits: validated.usage_limits,
            prompt_document: validated.document_binding,
            is_capability: true,
            bypass_metering: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attestgate_core::capability::{Principal, TokenNode};
    use attestgate_core::message::now;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryUsers {
        by_id: Mutex<std::collections::HashMap<String, User>>,
    }

    #[async_trait]
    impl UserRepository for InMemoryUsers {
        async fn find_by_user_id(&self, user_id: &str) -> Result<Option<User>, AuthError> {
            Ok(self.by_id.lock().unwrap().get(user_id).cloned())
        }
        async fn find_by_api_key(&self, api_key: &str) -> Result<Option<User>, AuthError> {
            Ok(self.by_id.lock().unwrap().get(api_key).cloned())
        }
        async fn insert(&self, user: &User) -> Result<(), AuthError> {
            self.by_id
                .lock()
                .unwrap()
                .insert(user.user_id.clone(), user.clone());
            Ok(())
        }
    }

    fn node(issuer: &str, audience: &str, command: &str) -> TokenNode {
        TokenNode {
            issuer: Principal { public_key: issuer.to_string() },
            audience: Principal { public_key: audience.to_string() },
            subject: Principal { public_key: issuer.to_string() },
            command: command.to_string(),
            expires_at: now() + Duration::seconds(3600),
            meta: BTreeMap::new(),
            signature: format!("sig-{issuer}"),
        }
    }

    #[tokio::test]
    async fn docs_token_bypass_provisions_and_admits() {
        let repo = std::sync::Arc::new(InMemoryUsers::default());
        let inner = ApiKeyStrategy::new(repo.clone());
        let strategy = DocsTokenBypass::new(Some("docs-secret".to_string()), repo, inner);

        let info = strategy.authenticate("docs-secret").await.unwrap();
        assert_eq!(info.user.user_id, "docs-secret");
    }

    #[tokio::test]
    async fn api_key_strategy_rejects_unknown_keys() {
        let repo = std::sync::Arc::new(InMemoryUsers::default());
        let strategy = ApiKeyStrategy::new(repo);
        let result = strategy.authenticate("nope").await;
        assert!(matches!(result, Err(AuthError::CredentialRejected(_))));
    }

    #[tokio::test]
    async fn nuc_strategy_provisions_new_user_on_first_use() {
        let repo = std::sync::Arc::new(InMemoryUsers::default());
        let strategy = NucStrategy::new(
            repo,
            Principal { public_key: "gw".to_string() }.did(),
            Vec::new(),
            |_raw| {
                Ok(CapabilityToken {
                    root: node("issuer-1", "gw", "/nil/ai"),
                    proofs: vec![],
                    invocation: node("issuer-1", "gw", "/nil/ai/chat/completions"),
                })
            },
        );

        let info = strategy.authenticate("opaque-wire-token").await.unwrap();
        assert_eq!(info.user.user_id, Principal { public_key: "issuer-1".to_string() }.did());
    }
}
