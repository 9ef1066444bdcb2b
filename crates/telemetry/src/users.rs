//! `users` table DAO, implementing `attestgate_auth::UserRepository` against
//! the same `sqlx::SqlitePool` the query log uses. `rate_limits` is stored as
//! a JSON blob matching `RateLimits`'s shape (Open Question 1's resolution).

use async_trait::async_trait;
use attestgate_auth::UserRepository;
use attestgate_core::error::AuthError;
use attestgate_core::user::{RateLimits, User};
use sqlx::SqlitePool;

pub struct SqlxUserRepository {
    pool: SqlitePool,
}

impl SqlxUserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_user(user_id: String, rate_limits_json: String) -> User {
    let rate_limits = serde_json::from_str::<RateLimits>(&rate_limits_json).unwrap_or_default();
    User { user_id, rate_limits }
}

#[async_trait]
impl UserRepository for SqlxUserRepository {
    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<User>, AuthError> {
        let row: Option<(String, String)> = sqlx::query_as("SELECT user_id, rate_limits FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AuthError::CredentialRejected(e.to_string()))?;

        Ok(row.map(|(id, limits)| row_to_user(id, limits)))
    }

    /// API-key auth has no separate key column in this schema — `user_id`
    /// doubles as the API key, matching the docs-token bypass's convention
    /// of naming the provisioned user after its own credential.
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<User>, AuthError> {
        self.find_by_user_id(api_key).await
    }

    async fn insert(&self, user: &User) -> Result<(), AuthError> {
        let rate_limits_json = serde_json::to_string(&user.rate_limits).map_err(|e| AuthError::CredentialRejected(e.to_string()))?;
        sqlx::query("INSERT INTO users (user_id, rate_limits) VALUES (?, ?) ON CONFLICT(user_id) DO UPDATE SET rate_limits = excluded.rate_limits")
            .bind(&user.user_id)
            .bind(rate_limits_json)
            .execute(&self.pool)
            .await
            .map_err(|e| AuthError::CredentialRejected(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::querylog::SqlxQueryLogStore;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqlxQueryLogStore::migrate(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn insert_then_find_round_trips() {
        let pool = test_pool().await;
        let repo = SqlxUserRepository::new(pool);
        let user = User::new("did:nil:abc".to_string());
        repo.insert(&user).await.unwrap();

        let found = repo.find_by_user_id("did:nil:abc").await.unwrap().unwrap();
        assert_eq!(found.user_id, "did:nil:abc");
    }

    #[tokio::test]
    async fn missing_user_returns_none() {
        let pool = test_pool().await;
        let repo = SqlxUserRepository::new(pool);
        assert!(repo.find_by_user_id("nobody").await.unwrap().is_none());
    }
}
