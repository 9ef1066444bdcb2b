//! The per-request audit record, written to the `query_logs` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLog {
    pub user_id: String,
    pub lockid: String,
    pub query_timestamp: DateTime<Utc>,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub tool_calls: i64,
    pub web_search_calls: i64,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i64>,
    pub response_time_ms: i64,
    pub model_response_time_ms: i64,
    pub tool_response_time_ms: i64,
    pub was_streamed: bool,
    pub was_multimodal: bool,
    pub was_nildb: bool,
    pub was_nilrag: bool,
    pub error_code: i32,
    pub error_message: String,
}

impl QueryLog {
    /// A fresh, unpopulated record for a request that hasn't resolved
    /// `user_id`/`model` yet. `commit()` in `attestgate-telemetry` refuses
    /// to persist a record still carrying these placeholders.
    pub fn pending(lockid: impl Into<String>) -> Self {
        Self {
            user_id: String::new(),
            lockid: lockid.into(),
            query_timestamp: Utc::now(),
            model: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            tool_calls: 0,
            web_search_calls: 0,
            temperature: None,
            max_tokens: None,
            response_time_ms: 0,
            model_response_time_ms: 0,
            tool_response_time_ms: 0,
            was_streamed: false,
            was_multimodal: false,
            was_nildb: false,
            was_nilrag: false,
            error_code: 200,
            error_message: String::new(),
        }
    }

    pub fn is_committable(&self) -> bool {
        !self.user_id.is_empty() && !self.model.is_empty()
    }

    /// Anti-abuse policy: 4xx responses are never written to the database.
    pub fn should_persist(&self) -> bool {
        self.is_committable() && (self.error_code < 400 || self.error_code >= 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_record_is_not_committable() {
        let log = QueryLog::pending("lock-1");
        assert!(!log.is_committable());
    }

    #[test]
    fn populated_record_is_committable() {
        let mut log = QueryLog::pending("lock-1");
        log.user_id = "u1".into();
        log.model = "m1".into();
        assert!(log.is_committable());
    }

    #[test]
    fn four_xx_is_never_persisted() {
        let mut log = QueryLog::pending("lock-1");
        log.user_id = "u1".into();
        log.model = "m1".into();
        log.error_code = 429;
        assert!(!log.should_persist());
        log.error_code = 500;
        assert!(log.should_persist());
        log.error_code = 200;
        assert!(log.should_persist());
    }
}
