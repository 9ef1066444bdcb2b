//! `redis`-backed implementation of [`KvStore`], using a multiplexed
//! `ConnectionManager` so every caller shares one connection and the
//! rate-limit script is uploaded once and invoked by its SHA.

use async_trait::async_trait;
use attestgate_core::error::KvError;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::{KvStore, RATE_LIMIT_SCRIPT};

pub struct RedisKvStore {
    conn: ConnectionManager,
    rate_limit_script: Script,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(|e| KvError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| KvError::Connection(e.to_string()))?;
        Ok(Self {
            conn,
            rate_limit_script: Script::new(RATE_LIMIT_SCRIPT),
        })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn check_rate_limit(
        &self,
        key: &str,
        limit: i64,
        window_ms: i64,
    ) -> Result<i64, KvError> {
        let mut conn = self.conn.clone();
        self.rate_limit_script
            .key(key)
            .arg(limit)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| KvError::Script(e.to_string()))
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }

    async fn decr(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.conn.clone();
        conn.decr(key, 1)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, KvError> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        if ttl_secs == 0 {
            conn.set(key, value)
                .await
                .map_err(|e| KvError::Command(e.to_string()))
        } else {
            conn.set_ex(key, value, ttl_secs)
                .await
                .map_err(|e| KvError::Command(e.to_string()))
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        conn.del(key)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let keys: Vec<String> = conn
            .scan_match(pattern)
            .await
            .map_err(|e| KvError::Command(e.to_string()))?
            .collect()
            .await;
        Ok(keys)
    }
}
