//! The single multiplexed channel to the trading venue and the in-process
//! fan-out built on top of it: connection lifecycle (framing, correlation,
//! reconnect, heartbeat, readiness), the quote bus, and the spot
//! subscription index that routes inbound ticks to their owners.

pub mod connection;
pub mod error;
pub mod quote_bus;
pub mod subscriptions;

pub use connection::{
    ConnectionConfig, GateState, UpstreamConnection, UpstreamHandle, UpstreamResponse,
};
pub use error::UpstreamError;
pub use quote_bus::{Quote, QuoteBus, QuoteBusError, QuoteKey, MAX_WAITERS_PER_KEY};
pub use subscriptions::{SpotRoute, SubscriptionIndex};
