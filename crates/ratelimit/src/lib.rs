//! Per-user fixed-window rate limiting plus a global concurrency gauge.
//!
//! Every bucket is a `(key, limit, window_ms)` triple evaluated against the
//! shared KV store's atomic rate-limit script. A `window_ms` of 0 means the
//! bucket never expires (the "forever" tier).

use std::sync::Arc;

use attestgate_core::capability::RateLimitAttenuation;
use attestgate_core::error::RateLimitError;
use attestgate_core::user::EffectiveRateLimits;
use attestgate_kv::KvStore;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

#[derive(Clone, Copy)]
pub struct WebSearchConfig {
    pub rps: i64,
    pub max_concurrent_requests: i64,
    pub max_topics: i64,
}

impl WebSearchConfig {
    /// The global web-search RPS bucket is capped by both the configured RPS
    /// ceiling and the per-request topic fan-out, so a burst of multi-topic
    /// searches can't starve concurrent single-topic ones.
    fn allowed_rps(&self) -> i64 {
        self.rps.min((self.max_concurrent_requests / self.max_topics.max(1)).max(1))
    }
}

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    web_search: WebSearchConfig,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, web_search: WebSearchConfig) -> Self {
        Self { kv, web_search }
    }

    /// A negative limit means "unlimited" and skips the bucket entirely,
    /// mirroring the original config's `None` meaning no cap.
    async fn check_bucket(&self, key: &str, limit: i64, window_ms: i64) -> Result<(), RateLimitError> {
        if limit < 0 {
            return Ok(());
        }
        let wait_ms = self.kv.check_rate_limit(key, limit, window_ms).await?;
        if wait_ms > 0 {
            tracing::warn!(key, wait_ms, limit, "rate limit exceeded");
            return Err(RateLimitError::Exceeded {
                retry_after_ms: wait_ms as u64,
            });
        }
        Ok(())
    }

    /// Check the four chat buckets (minute/hour/day/forever) for `user_id`.
    pub async fn check_chat_limits(
        &self,
        user_id: &str,
        limits: &EffectiveRateLimits,
    ) -> Result<(), RateLimitError> {
        self.check_bucket(&format!("minute:{user_id}"), limits.minute, MINUTE_MS).await?;
        self.check_bucket(&format!("hour:{user_id}"), limits.hour, HOUR_MS).await?;
        self.check_bucket(&format!("day:{user_id}"), limits.day, DAY_MS).await?;
        self.check_bucket(&format!("user:{user_id}"), limits.forever, 0).await?;
        Ok(())
    }

    /// Check every attenuated usage-limit bucket carried by a capability
    /// token's proof chain. Each is keyed by its own signature, with a TTL
    /// equal to the remaining validity window of that proof.
    pub async fn check_token_limits(
        &self,
        attenuations: &[RateLimitAttenuation],
    ) -> Result<(), RateLimitError> {
        for a in attenuations {
            self.check_bucket(&format!("token:{}", a.signature), a.usage_limit, a.ms_remaining())
                .await?;
        }
        Ok(())
    }

    /// Check the global web-search RPS burst bucket plus the per-user
    /// minute/hour/day/forever web-search buckets.
    pub async fn check_web_search_limits(
        &self,
        user_id: &str,
        limits: &EffectiveRateLimits,
    ) -> Result<(), RateLimitError> {
        self.check_bucket("global:web_search:rps", self.web_search.allowed_rps(), 1000)
            .await?;
        self.check_bucket(&format!("web_search:{user_id}"), limits.web_search_forever, 0)
            .await?;
        self.check_bucket(
            &format!("web_search_minute:{user_id}"),
            limits.web_search_minute,
            MINUTE_MS,
        )
        .await?;
        self.check_bucket(
            &format!("web_search_hour:{user_id}"),
            limits.web_search_hour,
            HOUR_MS,
        )
        .await?;
        self.check_bucket(
            &format!("web_search_day:{user_id}"),
            limits.web_search_day,
            DAY_MS,
        )
        .await?;
        Ok(())
    }

    /// Increment the concurrency gauge for `key`, rejecting if it exceeds
    /// `max_concurrent`. Returns a guard that decrements on drop — but since
    /// the decrement is itself async, callers must call `release` explicitly
    /// (mirroring the finally-block pattern this is ported from).
    pub async fn acquire_concurrent(
        &self,
        key: &str,
        max_concurrent: i64,
    ) -> Result<(), RateLimitError> {
        let gauge_key = format!("concurrent:{key}");
        let current = self.kv.incr(&gauge_key).await?;
        if current > max_concurrent {
            self.kv.decr(&gauge_key).await?;
            return Err(RateLimitError::Exceeded { retry_after_ms: 0 });
        }
        Ok(())
    }

    pub async fn release_concurrent(&self, key: &str) -> Result<(), RateLimitError> {
        self.kv.decr(&format!("concurrent:{key}")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attestgate_core::user::{RateLimitDefaults, RateLimits};
    use attestgate_kv::FakeKvStore;

    fn limiter() -> RateLimiter {
        RateLimiter::new(
            Arc::new(FakeKvStore::new()),
            WebSearchConfig {
                rps: 5,
                max_concurrent_requests: 50,
                max_topics: 4,
            },
        )
    }

    fn limits() -> EffectiveRateLimits {
        RateLimits::default().get_effective_limits(RateLimitDefaults {
            minute: 2,
            hour: 500,
            day: 5000,
            forever: -1,
            web_search_minute: 5,
            web_search_hour: 50,
            web_search_day: 200,
        })
    }

    #[tokio::test]
    async fn chat_limits_deny_after_minute_bucket_saturates() {
        let limiter = limiter();
        let limits = limits();
        limiter.check_chat_limits("u1", &limits).await.unwrap();
        limiter.check_chat_limits("u1", &limits).await.unwrap();
        let result = limiter.check_chat_limits("u1", &limits).await;
        assert!(matches!(result, Err(RateLimitError::Exceeded { .. })));
    }

    #[tokio::test]
    async fn negative_forever_limit_means_unlimited() {
        let limiter = limiter();
        let mut limits = limits();
        limits.minute = -1;
        limits.hour = -1;
        limits.day = -1;
        assert_eq!(limits.forever, -1);
        for _ in 0..5 {
            limiter.check_chat_limits("u2", &limits).await.unwrap();
        }
    }

    #[tokio::test]
    async fn concurrency_gauge_rejects_past_the_cap() {
        let limiter = limiter();
        limiter.acquire_concurrent("/v1/chat", 1).await.unwrap();
        let result = limiter.acquire_concurrent("/v1/chat", 1).await;
        assert!(result.is_err());
        limiter.release_concurrent("/v1/chat").await.unwrap();
        limiter.acquire_concurrent("/v1/chat", 1).await.unwrap();
    }
}
