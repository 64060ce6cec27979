//! HTTP gateway to the trading venue: orchestration of sessions, symbols,
//! quotes, and orders over the single upstream channel.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod service;

pub use api::{create_router, AppState};
pub use config::{Config, ConfigError};
pub use context::{RequestContext, RequestId};
pub use error::{GatewayError, Result};
pub use service::{GatewayService, TradeRequest};
