//! In-process quote fan-out.
//!
//! Maps `(user, environment, account, symbol)` to the last received quote
//! and lets request handlers block for the next tick with a bounded,
//! timed waiter queue per key. Waiters that time out keep their queue slot
//! until the next upsert drains them, but closed slots are reclaimed when a
//! new waiter arrives, so the bound holds.

use common::Environment;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Maximum simultaneous waiters per quote key.
pub const MAX_WAITERS_PER_KEY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuoteKey {
    pub user_id: String,
    pub env: Environment,
    pub account_id: i64,
    pub symbol_id: i64,
}

/// A spot tick. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub user_id: String,
    pub env: Environment,
    pub account_id: i64,
    pub symbol_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Quote {
    pub fn key(&self) -> QuoteKey {
        QuoteKey {
            user_id: self.user_id.clone(),
            env: self.env,
            account_id: self.account_id,
            symbol_id: self.symbol_id,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuoteBusError {
    /// No tick arrived inside the caller's window.
    #[error("QUOTE_TIMEOUT")]
    Timeout,

    #[error("too many waiters for quote key")]
    TooManyWaiters,

    #[error("quote bus closed")]
    Closed,
}

#[derive(Default)]
struct Inner {
    last: HashMap<QuoteKey, Quote>,
    waiters: HashMap<QuoteKey, Vec<oneshot::Sender<Quote>>>,
}

/// Last-quote map plus per-key waiter queues.
#[derive(Default)]
pub struct QuoteBus {
    inner: Mutex<Inner>,
}

impl QuoteBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the quote and resolve every waiter registered for its key.
    /// All waiters are drained before this returns.
    pub fn upsert(&self, quote: Quote) {
        let key = quote.key();
        let mut inner = self.inner.lock().expect("quote bus lock");
        inner.last.insert(key.clone(), quote.clone());
        if let Some(waiters) = inner.waiters.remove(&key) {
            debug!("resolving {} quote waiters for symbol {}", waiters.len(), key.symbol_id);
            for waiter in waiters {
                let _ = waiter.send(quote.clone());
            }
        }
    }

    pub fn get_last(&self, key: &QuoteKey) -> Option<Quote> {
        self.inner.lock().expect("quote bus lock").last.get(key).cloned()
    }

    fn enqueue(&self, key: &QuoteKey) -> Result<oneshot::Receiver<Quote>, QuoteBusError> {
        let mut inner = self.inner.lock().expect("quote bus lock");
        let waiters = inner.waiters.entry(key.clone()).or_default();
        waiters.retain(|w| !w.is_closed());
        if waiters.len() >= MAX_WAITERS_PER_KEY {
            return Err(QuoteBusError::TooManyWaiters);
        }
        let (tx, rx) = oneshot::channel();
        waiters.push(tx);
        Ok(rx)
    }

    /// Wait for the next tick on `key`, up to `timeout`.
    pub async fn wait_for_next(
        &self,
        key: &QuoteKey,
        timeout: Duration,
    ) -> Result<Quote, QuoteBusError> {
        let rx = self.enqueue(key)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(quote)) => Ok(quote),
            Ok(Err(_)) => Err(QuoteBusError::Closed),
            Err(_) => Err(QuoteBusError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(symbol_id: i64, bid: u64) -> Quote {
        Quote {
            user_id: "u1".to_string(),
            env: Environment::Demo,
            account_id: 42,
            symbol_id,
            bid: Some(bid),
            ask: Some(bid + 2),
            timestamp: Some(1_700_000_000_000),
        }
    }

    #[test]
    fn test_upsert_then_get_last() {
        let bus = QuoteBus::new();
        let q = quote(1, 11000);
        bus.upsert(q.clone());
        assert_eq!(bus.get_last(&q.key()), Some(q.clone()));
        // Different symbol, no quote.
        let other = quote(2, 0).key();
        assert_eq!(bus.get_last(&other), None);
    }

    #[test]
    fn test_upsert_replaces() {
        let bus = QuoteBus::new();
        bus.upsert(quote(1, 100));
        bus.upsert(quote(1, 200));
        assert_eq!(bus.get_last(&quote(1, 0).key()).unwrap().bid, Some(200));
    }

    #[tokio::test]
    async fn test_waiter_resolved_by_upsert() {
        let bus = std::sync::Arc::new(QuoteBus::new());
        let key = quote(1, 0).key();
        let waiter = {
            let bus = bus.clone();
            let key = key.clone();
            tokio::spawn(async move { bus.wait_for_next(&key, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        bus.upsert(quote(1, 123));
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.bid, Some(123));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_times_out() {
        let bus = QuoteBus::new();
        let key = quote(1, 0).key();
        let err = bus
            .wait_for_next(&key, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert_eq!(err, QuoteBusError::Timeout);
        assert_eq!(err.to_string(), "QUOTE_TIMEOUT");
    }

    #[test]
    fn test_waiter_bound_enforced() {
        let bus = QuoteBus::new();
        let key = quote(1, 0).key();
        let mut receivers = Vec::new();
        for _ in 0..MAX_WAITERS_PER_KEY {
            receivers.push(bus.enqueue(&key).unwrap());
        }
        assert_eq!(bus.enqueue(&key).unwrap_err(), QuoteBusError::TooManyWaiters);
        // A timed-out (dropped) waiter frees its slot for the next enqueue.
        receivers.pop();
        assert!(bus.enqueue(&key).is_ok());
    }

    #[tokio::test]
    async fn test_all_waiters_drained_by_one_upsert() {
        let bus = std::sync::Arc::new(QuoteBus::new());
        let key = quote(1, 0).key();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let bus = bus.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                bus.wait_for_next(&key, Duration::from_secs(5)).await
            }));
        }
        tokio::task::yield_now().await;
        bus.upsert(quote(1, 7));
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().bid, Some(7));
        }
    }
}
