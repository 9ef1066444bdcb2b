//! In-process stand-in for [`KvStore`], used by the rate limiter and
//! registry test suites so they don't need a live redis instance.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use attestgate_core::error::KvError;

use crate::KvStore;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct FakeKvStore {
    data: Mutex<HashMap<String, Entry>>,
}

impl FakeKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, key: &str) -> Option<String> {
        let mut guard = self.data.lock().unwrap();
        match guard.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|t| t <= Instant::now()) {
                    guard.remove(key);
                    None
                } else {
                    Some(entry.value.clone())
                }
            }
            None => None,
        }
    }
}

#[async_trait]
impl KvStore for FakeKvStore {
    async fn check_rate_limit(
        &self,
        key: &str,
        limit: i64,
        window_ms: i64,
    ) -> Result<i64, KvError> {
        let mut guard = self.data.lock().unwrap();
        let current: i64 = match guard.get(key) {
            Some(entry) if !entry.expires_at.is_some_and(|t| t <= Instant::now()) => {
                entry.value.parse().unwrap_or(0)
            }
            _ => 0,
        };
        if current > 0 {
            if current + 1 > limit {
                let remaining = guard
                    .get(key)
                    .and_then(|e| e.expires_at)
                    .map(|t| t.saturating_duration_since(Instant::now()).as_millis() as i64)
                    .unwrap_or(0);
                return Ok(remaining);
            }
            let entry = guard.get_mut(key).unwrap();
            entry.value = (current + 1).to_string();
            Ok(0)
        } else {
            let expires_at = if window_ms > 0 {
                Some(Instant::now() + Duration::from_millis(window_ms as u64))
            } else {
                None
            };
            guard.insert(
                key.to_string(),
                Entry {
                    value: "1".to_string(),
                    expires_at,
                },
            );
            Ok(0)
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut guard = self.data.lock().unwrap();
        let current: i64 = guard.get(key).and_then(|e| e.value.parse().ok()).unwrap_or(0);
        let next = current + 1;
        let expires_at = guard.get(key).and_then(|e| e.expires_at);
        guard.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn decr(&self, key: &str) -> Result<i64, KvError> {
        let mut guard = self.data.lock().unwrap();
        let current: i64 = guard.get(key).and_then(|e| e.value.parse().ok()).unwrap_or(0);
        let next = current - 1;
        let expires_at = guard.get(key).and_then(|e| e.expires_at);
        guard.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, KvError> {
        Ok(self.read(key).and_then(|v| v.parse().ok()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        let expires_at = if ttl_secs > 0 {
            Some(Instant::now() + Duration::from_secs(ttl_secs))
        } else {
            None
        };
        self.data.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.read(key))
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let guard = self.data.lock().unwrap();
        let now = Instant::now();
        Ok(guard
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.expires_at.is_some_and(|t| t <= now))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_requests_under_the_limit() {
        let kv = FakeKvStore::new();
        for _ in 0..3 {
            let wait = kv.check_rate_limit("bucket", 3, 60_000).await.unwrap();
            assert_eq!(wait, 0);
        }
        let wait = kv.check_rate_limit("bucket", 3, 60_000).await.unwrap();
        assert!(wait > 0);
    }

    #[tokio::test]
    async fn forever_bucket_has_no_ttl_but_still_enforces_the_limit() {
        let kv = FakeKvStore::new();
        let first = kv.check_rate_limit("forever", 2, 0).await.unwrap();
        let second = kv.check_rate_limit("forever", 2, 0).await.unwrap();
        let third = kv.check_rate_limit("forever", 2, 0).await.unwrap();
        assert_eq!((first, second), (0, 0));
        // No TTL is set on a forever bucket, so a denial has nothing to report
        // a countdown against and reads as an immediate-retry 0ms wait.
        assert_eq!(third, 0);
    }

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let kv = FakeKvStore::new();
        kv.set_with_ttl("k", "v", 0).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
        kv.delete("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_prefix_finds_matching_keys_only() {
        let kv = FakeKvStore::new();
        kv.set_with_ttl("models/a", "1", 0).await.unwrap();
        kv.set_with_ttl("models/b", "1", 0).await.unwrap();
        kv.set_with_ttl("users/a", "1", 0).await.unwrap();
        let mut found = kv.scan_prefix("models/").await.unwrap();
        found.sort();
        assert_eq!(found, vec!["models/a".to_string(), "models/b".to_string()]);
    }
}
