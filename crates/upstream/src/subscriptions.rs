//! Spot subscription index.
//!
//! The venue pushes spot events keyed only by `(ctidTraderAccountId,
//! symbolId)`; this index remembers which user subscribed so inbound ticks
//! can be attributed and published on the quote bus. Entries are registered
//! before the subscribe request goes out and overwritten on resubscribe.

use common::Environment;
use dashmap::DashMap;

/// Owner of a spot subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotRoute {
    pub user_id: String,
    pub env: Environment,
    pub account_id: i64,
}

#[derive(Default)]
pub struct SubscriptionIndex {
    routes: DashMap<(i64, i64), SpotRoute>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, account_id: i64, symbol_id: i64, route: SpotRoute) {
        self.routes.insert((account_id, symbol_id), route);
    }

    pub fn resolve(&self, account_id: i64, symbol_id: i64) -> Option<SpotRoute> {
        self.routes.get(&(account_id, symbol_id)).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let index = SubscriptionIndex::new();
        let route = SpotRoute {
            user_id: "u1".to_string(),
            env: Environment::Demo,
            account_id: 42,
        };
        index.register(42, 1, route.clone());
        assert_eq!(index.resolve(42, 1), Some(route));
        assert_eq!(index.resolve(42, 2), None);
        assert_eq!(index.resolve(7, 1), None);
    }

    #[test]
    fn test_reregister_overwrites() {
        let index = SubscriptionIndex::new();
        let demo = SpotRoute {
            user_id: "u1".to_string(),
            env: Environment::Demo,
            account_id: 42,
        };
        let live = SpotRoute {
            env: Environment::Live,
            ..demo.clone()
        };
        index.register(42, 1, demo);
        index.register(42, 1, live.clone());
        assert_eq!(index.resolve(42, 1), Some(live));
        assert_eq!(index.len(), 1);
    }
}
