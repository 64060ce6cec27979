//! Key/value store abstraction.
//!
//! The gateway only needs a narrow slice of redis: string get/set with TTL,
//! delete, and hash operations with incremental scan. Putting that slice
//! behind a trait keeps the session and symbol stores testable against an
//! in-memory implementation.

use crate::error::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Minimal KV surface required by the stores.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// `ttl: Some(secs)` sets an expiry on the write; `None` keeps whatever
    /// TTL the key already carries.
    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hset_all(&self, key: &str, entries: &HashMap<String, String>) -> Result<()>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hlen(&self, key: &str) -> Result<u64>;

    /// Incremental hash scan with a glob pattern, accumulating until the
    /// cursor is exhausted or `limit` entries are collected.
    async fn hscan(
        &self,
        key: &str,
        pattern: &str,
        count: u64,
        limit: usize,
    ) -> Result<Vec<(String, String)>>;

    async fn expire(&self, key: &str, ttl: u64) -> Result<()>;
}

/// Shared redis-backed implementation.
#[derive(Clone)]
pub struct RedisKv {
    client: Arc<redis::Client>,
}

impl RedisKv {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<()> {
        let mut conn = self.connection().await?;
        match ttl {
            Some(secs) => conn.set_ex::<_, _, ()>(key, value, secs).await?,
            None => {
                // Plain SET would clear an existing expiry.
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("KEEPTTL")
                    .query_async::<()>(&mut conn)
                    .await?
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hset_all(&self, key: &str, entries: &HashMap<String, String>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let items: Vec<(String, String)> = entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        conn.hset_multiple::<_, _, _, ()>(key, &items).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.connection().await?;
        let entries: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(entries)
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.hlen(key).await?;
        Ok(len)
    }

    async fn hscan(
        &self,
        key: &str,
        pattern: &str,
        count: u64,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut out = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("HSCAN")
                .arg(key)
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await?;
            // HSCAN replies with a flat field/value list.
            for pair in batch.chunks(2) {
                if let [field, value] = pair {
                    out.push((field.clone(), value.clone()));
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(out)
    }

    async fn expire(&self, key: &str, ttl: u64) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.expire::<_, ()>(key, ttl as i64).await?;
        Ok(())
    }
}

/// In-memory implementation for tests and local development. TTLs are
/// recorded but never enforced; `ttl_of` exposes them for assertions.
#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    ttls: HashMap<String, u64>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently recorded TTL for a key, if any.
    pub fn ttl_of(&self, key: &str) -> Option<u64> {
        self.inner.lock().expect("kv lock").ttls.get(key).copied()
    }
}

/// The stores only ever issue `*` and `*NEEDLE*` patterns.
fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(mid) = pattern.strip_prefix('*').and_then(|p| p.strip_suffix('*')) {
        return value.contains(mid);
    }
    pattern == value
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().expect("kv lock").strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<()> {
        let mut inner = self.inner.lock().expect("kv lock");
        inner.strings.insert(key.to_string(), value.to_string());
        if let Some(secs) = ttl {
            inner.ttls.insert(key.to_string(), secs);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("kv lock");
        inner.strings.remove(key);
        inner.hashes.remove(key);
        inner.ttls.remove(key);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .expect("kv lock")
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hset_all(&self, key: &str, entries: &HashMap<String, String>) -> Result<()> {
        let mut inner = self.inner.lock().expect("kv lock");
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .inner
            .lock()
            .expect("kv lock")
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        Ok(self
            .inner
            .lock()
            .expect("kv lock")
            .hashes
            .get(key)
            .map(|h| h.len() as u64)
            .unwrap_or(0))
    }

    async fn hscan(
        &self,
        key: &str,
        pattern: &str,
        _count: u64,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        Ok(self
            .inner
            .lock()
            .expect("kv lock")
            .hashes
            .get(key)
            .map(|h| {
                h.iter()
                    .filter(|(f, _)| glob_match(pattern, f))
                    .take(limit)
                    .map(|(f, v)| (f.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: u64) -> Result<()> {
        self.inner
            .lock()
            .expect("kv lock")
            .ttls
            .insert(key.to_string(), ttl);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "ANYTHING"));
        assert!(glob_match("*EUR*", "EURUSD"));
        assert!(glob_match("*USD*", "EURUSD"));
        assert!(!glob_match("*GBP*", "EURUSD"));
        assert!(glob_match("EURUSD", "EURUSD"));
    }

    #[tokio::test]
    async fn test_memory_kv_set_keeps_ttl_when_none() {
        let kv = MemoryKv::new();
        kv.set("k", "v1", Some(60)).await.unwrap();
        kv.set("k", "v2", None).await.unwrap();
        assert_eq!(kv.ttl_of("k"), Some(60));
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v2"));
    }
}
