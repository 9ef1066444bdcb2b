//! Shared key-value store trait, backing rate limiting (C4) and service
//! discovery (C3). The real implementation wraps `redis`'s
//! `ConnectionManager`; `fake` provides an in-process stand-in for tests.

pub mod fake;
pub mod redis_store;

use async_trait::async_trait;
use attestgate_core::error::KvError;

/// The fixed-window rate-limit script, evaluated atomically against a
/// single counter key.
///
/// Returns 0 if the request is admitted, or the number of milliseconds
/// until the window resets if it is denied.
pub const RATE_LIMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local expire_time = tonumber(ARGV[2])
local current = tonumber(redis.call('get', key) or "0")
if current > 0 then
    if current + 1 > limit then
        return redis.call("PTTL", key)
    else
        redis.call("INCR", key)
        return 0
    end
else
    if expire_time > 0 then
        redis.call("SET", key, 1, "px", expire_time)
    else
        redis.call("SET", key, 1)
    end
    return 0
end
"#;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Evaluate the fixed-window rate-limit script against `key`.
    /// `window_ms == 0` means no expiry (a "forever" bucket).
    async fn check_rate_limit(&self, key: &str, limit: i64, window_ms: i64)
    -> Result<i64, KvError>;

    async fn incr(&self, key: &str) -> Result<i64, KvError>;
    async fn decr(&self, key: &str) -> Result<i64, KvError>;
    async fn get_i64(&self, key: &str) -> Result<Option<i64>, KvError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError>;
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// List keys matching a `prefix*` pattern. Used by service discovery
    /// to enumerate `models/*` registrations.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

pub use fake::FakeKvStore;
pub use redis_store::RedisKvStore;
