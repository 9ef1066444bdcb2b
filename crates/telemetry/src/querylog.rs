//! Persistence for [`QueryLog`] records and the aggregate usage query behind
//! `GET /v1/usage`. The orchestrator calls `commit()` according to the
//! DB-logging policy — 2xx and 5xx are written, 4xx are not.

use async_trait::async_trait;
use attestgate_core::error::TelemetryError;
use attestgate_core::query_log::QueryLog;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageTotals {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[async_trait]
pub trait QueryLogStore: Send + Sync {
    async fn commit(&self, log: &QueryLog) -> Result<(), TelemetryError>;
    async fn usage_totals(&self, user_id: &str) -> Result<UsageTotals, TelemetryError>;
}

pub struct SqlxQueryLogStore {
    pool: SqlitePool,
}

impl SqlxQueryLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(dsn: &str) -> Result<SqlitePool, TelemetryError> {
        SqlitePool::connect(dsn).await.map_err(|e| TelemetryError::Database(e.to_string()))
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<(), TelemetryError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| TelemetryError::Database(e.to_string()))
    }

    /// Commits in the background, logging-and-swallowing any DB error rather
    /// than propagating it — persistence failures must never fail the
    /// response that already went out to the client.
    pub fn commit_background(store: std::sync::Arc<Self>, log: QueryLog) {
        tokio::spawn(async move {
            if let Err(e) = store.commit(&log).await {
                warn!(error = %e, user_id = %log.user_id, "failed to persist query log");
            }
        });
    }
}

#[async_trait]
impl QueryLogStore for SqlxQueryLogStore {
    async fn commit(&self, log: &QueryLog) -> Result<(), TelemetryError> {
        if !log.should_persist() {
            return Ok(());
        }

        let result = sqlx::query(
            "INSERT INTO query_logs (
                user_id, lockid, query_timestamp, model, prompt_tokens, completion_tokens,
                total_tokens, tool_calls, web_search_calls, temperature, max_tokens,
                response_time_ms, model_response_time_ms, tool_response_time_ms,
                was_streamed, was_multimodal, was_nildb, was_nilrag, error_code, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&log.user_id)
        .bind(&log.lockid)
        .bind(log.query_timestamp.to_rfc3339())
        .bind(&log.model)
        .bind(log.prompt_tokens)
        .bind(log.completion_tokens)
        .bind(log.total_tokens)
        .bind(log.tool_calls)
        .bind(log.web_search_calls)
        .bind(log.temperature)
        .bind(log.max_tokens)
        .bind(log.response_time_ms)
        .bind(log.model_response_time_ms)
        .bind(log.tool_response_time_ms)
        .bind(log.was_streamed)
        .bind(log.was_multimodal)
        .bind(log.was_nildb)
        .bind(log.was_nilrag)
        .bind(log.error_code)
        .bind(&log.error_message)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            error!(error = %e, "query log insert failed");
            return Err(TelemetryError::Database(e.to_string()));
        }
        Ok(())
    }

    async fn usage_totals(&self, user_id: &str) -> Result<UsageTotals, TelemetryError> {
        let row: (Option<i64>, Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT SUM(prompt_tokens), SUM(completion_tokens), SUM(total_tokens) FROM query_logs WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TelemetryError::Database(e.to_string()))?;

        Ok(UsageTotals {
            prompt_tokens: row.0.unwrap_or(0),
            completion_tokens: row.1.unwrap_or(0),
            total_tokens: row.2.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attestgate_core::message::now;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqlxQueryLogStore::migrate(&pool).await.unwrap();
        pool
    }

    fn sample_log(user_id: &str, error_code: i32) -> QueryLog {
        QueryLog {
            user_id: user_id.to_string(),
            lockid: "lock-1".to_string(),
            query_timestamp: now(),
            model: "model-a".to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            tool_calls: 0,
            web_search_calls: 0,
            temperature: Some(0.7),
            max_tokens: Some(512),
            response_time_ms: 120,
            model_response_time_ms: 100,
            tool_response_time_ms: 0,
            was_streamed: false,
            was_multimodal: false,
            was_nildb: false,
            was_nilrag: false,
            error_code,
            error_message: String::new(),
        }
    }

    #[tokio::test]
    async fn commits_2xx_and_5xx_but_not_4xx() {
        let pool = test_pool().await;
        let store = SqlxQueryLogStore::new(pool);

        store.commit(&sample_log("user-1", 200)).await.unwrap();
        store.commit(&sample_log("user-1", 404)).await.unwrap();
        store.commit(&sample_log("user-1", 500)).await.unwrap();

        let totals = store.usage_totals("user-1").await.unwrap();
        assert_eq!(totals.total_tokens, 30);
    }

    #[tokio::test]
    async fn usage_totals_zero_for_unknown_user() {
        let pool = test_pool().await;
        let store = SqlxQueryLogStore::new(pool);
        let totals = store.usage_totals("nobody").await.unwrap();
        assert_eq!(totals.total_tokens, 0);
    }
}
