//! Configuration loaded from environment variables.

use common::Environment;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,
    /// Prometheus exporter port.
    pub metrics_port: u16,
    pub redis_url: String,
    pub token_encryption_key: String,
    pub symbol_cache_ttl_secs: u64,
    /// When set, every route except /health requires x-internal-key.
    pub internal_api_key: Option<String>,
    pub log_level: String,
    pub ctrader: CtraderConfig,
}

/// Upstream venue and OAuth application settings.
#[derive(Debug, Clone)]
pub struct CtraderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub default_env: Environment,
    pub demo_host: String,
    pub live_host: String,
    pub port: u16,
    pub proto_dir: PathBuf,
}

impl Config {
    /// Read configuration from process environment variables:
    /// - PORT (default: 8088)
    /// - METRICS_PORT (default: 9094)
    /// - REDIS_URL (default: redis://127.0.0.1:6379)
    /// - TOKEN_ENCRYPTION_KEY (required, 64 hex chars or base64 32 bytes)
    /// - SYMBOL_CACHE_TTL_SECS (default: 86400)
    /// - INTERNAL_API_KEY (optional)
    /// - LOG_LEVEL (default: info)
    /// - CTRADER_CLIENT_ID / CTRADER_CLIENT_SECRET (required)
    /// - CTRADER_REDIRECT_URI (default: empty)
    /// - CTRADER_ENV (demo|live, default: demo)
    /// - CTRADER_DEMO_HOST / CTRADER_LIVE_HOST
    /// - CTRADER_PORT (default: 5035)
    /// - CTRADER_PROTO_DIR (default: proto)
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));

        let port = parse_port("PORT", var("PORT"), 8088)?;
        let metrics_port = parse_port("METRICS_PORT", var("METRICS_PORT"), 9094)?;
        let ctrader_port = parse_port("CTRADER_PORT", var("CTRADER_PORT"), 5035)?;

        let default_env = match var("CTRADER_ENV") {
            Some(raw) => raw
                .parse::<Environment>()
                .map_err(|e| ConfigError::Invalid("CTRADER_ENV", e.to_string()))?,
            None => Environment::Demo,
        };

        let symbol_cache_ttl_secs = match var("SYMBOL_CACHE_TTL_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| ConfigError::Invalid("SYMBOL_CACHE_TTL_SECS", e.to_string()))?,
            None => external_services::symbols::DEFAULT_SYMBOL_TTL_SECS,
        };

        Ok(Self {
            port,
            metrics_port,
            redis_url: var("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            token_encryption_key: required("TOKEN_ENCRYPTION_KEY")?,
            symbol_cache_ttl_secs,
            internal_api_key: var("INTERNAL_API_KEY"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            ctrader: CtraderConfig {
                client_id: required("CTRADER_CLIENT_ID")?,
                client_secret: required("CTRADER_CLIENT_SECRET")?,
                redirect_uri: var("CTRADER_REDIRECT_URI").unwrap_or_default(),
                default_env,
                demo_host: var("CTRADER_DEMO_HOST")
                    .unwrap_or_else(|| "demo.ctraderapi.com".to_string()),
                live_host: var("CTRADER_LIVE_HOST")
                    .unwrap_or_else(|| "live.ctraderapi.com".to_string()),
                port: ctrader_port,
                proto_dir: PathBuf::from(var("CTRADER_PROTO_DIR").unwrap_or_else(|| "proto".to_string())),
            },
        })
    }

    /// For tests: read from a plain map instead of the process environment.
    #[cfg(test)]
    fn from_map(
        vars: &std::collections::HashMap<&str, &str>,
    ) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
    }
}

fn parse_port(name: &'static str, value: Option<String>, default: u16) -> Result<u16, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| ConfigError::Invalid(name, raw)),
    }
}
