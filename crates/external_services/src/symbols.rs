//! Persistent symbol catalog.
//!
//! One hash per `(user, environment, account)` mapping uppercase symbol
//! names to their venue-assigned numeric ids. The catalog is replaced
//! wholesale on refresh; symbol ids are stable per account but may differ
//! between accounts, so catalogs are never shared.

use crate::error::Result;
use crate::kv::Kv;
use common::Environment;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Redis key prefix for symbol catalogs: symbols:{userId}:{env}:{accountId}
pub const SYMBOL_KEY_PREFIX: &str = "symbols:";

/// Default catalog TTL: one day.
pub const DEFAULT_SYMBOL_TTL_SECS: u64 = 86_400;

/// HSCAN batch hint.
const SCAN_COUNT: u64 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolEntry {
    pub symbol: String,
    pub symbol_id: i64,
}

#[derive(Clone)]
pub struct SymbolStore {
    kv: Arc<dyn Kv>,
    ttl_secs: u64,
}

impl SymbolStore {
    pub fn new(kv: Arc<dyn Kv>, ttl_secs: u64) -> Self {
        Self { kv, ttl_secs }
    }

    fn key(user_id: &str, env: Environment, account_id: i64) -> String {
        format!("{SYMBOL_KEY_PREFIX}{user_id}:{env}:{account_id}")
    }

    pub async fn count(&self, user_id: &str, env: Environment, account_id: i64) -> Result<u64> {
        self.kv.hlen(&Self::key(user_id, env, account_id)).await
    }

    /// Single hash-field fetch; missing, non-numeric, and non-positive
    /// values all read as `None`.
    pub async fn get_symbol_id(
        &self,
        user_id: &str,
        env: Environment,
        account_id: i64,
        symbol: &str,
    ) -> Result<Option<i64>> {
        let field = symbol.trim().to_uppercase();
        let value = self
            .kv
            .hget(&Self::key(user_id, env, account_id), &field)
            .await?;
        Ok(value
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|id| *id > 0))
    }

    /// Atomically replace the whole catalog, then apply the TTL.
    pub async fn replace_all(
        &self,
        user_id: &str,
        env: Environment,
        account_id: i64,
        symbols: &HashMap<String, i64>,
    ) -> Result<()> {
        let key = Self::key(user_id, env, account_id);
        let entries: HashMap<String, String> = symbols
            .iter()
            .map(|(name, id)| (name.trim().to_uppercase(), id.to_string()))
            .collect();

        self.kv.del(&key).await?;
        if entries.is_empty() {
            return Ok(());
        }
        self.kv.hset_all(&key, &entries).await?;
        self.kv.expire(&key, self.ttl_secs).await?;
        debug!("symbol catalog replaced: {} entries at {}", entries.len(), key);
        Ok(())
    }

    /// Incremental scan with `*NEEDLE*`, falling back to a full read with a
    /// client-side substring filter when the scan comes back empty (some
    /// servers are quirky about patterns). An empty needle returns up to
    /// `limit` entries in arbitrary order.
    pub async fn search(
        &self,
        user_id: &str,
        env: Environment,
        account_id: i64,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<SymbolEntry>> {
        let key = Self::key(user_id, env, account_id);
        let needle_up = needle.trim().to_uppercase();
        let pattern = if needle_up.is_empty() {
            "*".to_string()
        } else {
            format!("*{needle_up}*")
        };

        let mut hits = self.kv.hscan(&key, &pattern, SCAN_COUNT, limit).await?;
        if hits.is_empty() {
            hits = self
                .kv
                .hgetall(&key)
                .await?
                .into_iter()
                .filter(|(field, _)| needle_up.is_empty() || field.contains(&needle_up))
                .take(limit)
                .collect();
        }

        Ok(hits
            .into_iter()
            .filter_map(|(symbol, id)| {
                id.parse::<i64>()
                    .ok()
                    .filter(|id| *id > 0)
                    .map(|symbol_id| SymbolEntry { symbol, symbol_id })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn store() -> (SymbolStore, MemoryKv) {
        let kv = MemoryKv::new();
        (
            SymbolStore::new(Arc::new(kv.clone()), DEFAULT_SYMBOL_TTL_SECS),
            kv,
        )
    }

    fn catalog() -> HashMap<String, i64> {
        HashMap::from([
            ("EURUSD".to_string(), 1),
            ("EURGBP".to_string(), 2),
            ("USDJPY".to_string(), 3),
        ])
    }

    #[tokio::test]
    async fn test_replace_all_then_lookup() {
        let (store, kv) = store();
        store
            .replace_all("u1", Environment::Demo, 42, &catalog())
            .await
            .unwrap();

        assert_eq!(store.count("u1", Environment::Demo, 42).await.unwrap(), 3);
        assert_eq!(
            store
                .get_symbol_id("u1", Environment::Demo, 42, "eurusd")
                .await
                .unwrap(),
            Some(1)
        );
        assert_eq!(
            store
                .get_symbol_id("u1", Environment::Demo, 42, "XAUUSD")
                .await
                .unwrap(),
            None
        );
        assert_eq!(kv.ttl_of("symbols:u1:demo:42"), Some(DEFAULT_SYMBOL_TTL_SECS));
    }

    #[tokio::test]
    async fn test_replace_all_drops_stale_entries() {
        let (store, _) = store();
        store
            .replace_all("u1", Environment::Demo, 42, &catalog())
            .await
            .unwrap();
        store
            .replace_all(
                "u1",
                Environment::Demo,
                42,
                &HashMap::from([("XAUUSD".to_string(), 9)]),
            )
            .await
            .unwrap();

        assert_eq!(store.count("u1", Environment::Demo, 42).await.unwrap(), 1);
        assert_eq!(
            store
                .get_symbol_id("u1", Environment::Demo, 42, "EURUSD")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_non_positive_ids_read_as_none() {
        let (store, _) = store();
        store
            .replace_all(
                "u1",
                Environment::Demo,
                1,
                &HashMap::from([("BAD".to_string(), 0), ("NEG".to_string(), -4)]),
            )
            .await
            .unwrap();
        assert_eq!(
            store.get_symbol_id("u1", Environment::Demo, 1, "BAD").await.unwrap(),
            None
        );
        assert_eq!(
            store.get_symbol_id("u1", Environment::Demo, 1, "NEG").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_search_by_substring() {
        let (store, _) = store();
        store
            .replace_all("u1", Environment::Demo, 42, &catalog())
            .await
            .unwrap();

        let mut hits = store
            .search("u1", Environment::Demo, 42, "eur", 10)
            .await
            .unwrap();
        hits.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        assert_eq!(
            hits,
            vec![
                SymbolEntry { symbol: "EURGBP".into(), symbol_id: 2 },
                SymbolEntry { symbol: "EURUSD".into(), symbol_id: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn test_search_empty_needle_respects_limit() {
        let (store, _) = store();
        store
            .replace_all("u1", Environment::Demo, 42, &catalog())
            .await
            .unwrap();
        let hits = store.search("u1", Environment::Demo, 42, "", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_search_different_account_is_isolated() {
        let (store, _) = store();
        store
            .replace_all("u1", Environment::Demo, 42, &catalog())
            .await
            .unwrap();
        let hits = store.search("u1", Environment::Demo, 7, "eur", 10).await.unwrap();
        assert!(hits.is_empty());
    }
}
