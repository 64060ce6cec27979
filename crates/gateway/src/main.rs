//! Gateway service entry point.

use anyhow::Result;
use external_services::{Kv, OAuthClient, RedisKv, SessionStore, SymbolStore, TokenCipher};
use gateway::{create_router, AppState, Config, GatewayService};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use upstream::{ConnectionConfig, QuoteBus, SubscriptionIndex, UpstreamConnection};
use wire::SchemaRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration first so LOG_LEVEL can seed the filter.
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!("Starting trading gateway");
    info!("  PORT: {}", config.port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  REDIS_URL: {}", config.redis_url);
    info!("  CTRADER_ENV: {}", config.ctrader.default_env);
    info!("  CTRADER_PROTO_DIR: {}", config.ctrader.proto_dir.display());

    // Prometheus exporter.
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    // Upstream schema.
    let registry = Arc::new(SchemaRegistry::load(&config.ctrader.proto_dir)?);
    info!("Protobuf schema loaded from {}", config.ctrader.proto_dir.display());

    // Stores.
    let kv: Arc<dyn Kv> = Arc::new(RedisKv::new(&config.redis_url)?);
    let cipher = Arc::new(TokenCipher::from_key_material(&config.token_encryption_key)?);
    let sessions = SessionStore::new(kv.clone(), cipher);
    let symbols = SymbolStore::new(kv, config.symbol_cache_ttl_secs);
    let oauth = OAuthClient::new(
        &config.ctrader.client_id,
        &config.ctrader.client_secret,
        &config.ctrader.redirect_uri,
    );

    // The single upstream channel and its fan-out.
    let quotes = Arc::new(QuoteBus::new());
    let subscriptions = Arc::new(SubscriptionIndex::new());
    let upstream = UpstreamConnection::start(
        registry,
        quotes.clone(),
        subscriptions.clone(),
        ConnectionConfig {
            demo_host: config.ctrader.demo_host.clone(),
            live_host: config.ctrader.live_host.clone(),
            port: config.ctrader.port,
            client_id: config.ctrader.client_id.clone(),
            client_secret: config.ctrader.client_secret.clone(),
            default_env: config.ctrader.default_env,
        },
    )?;

    let service = GatewayService::new(
        upstream.clone(),
        quotes,
        subscriptions,
        sessions,
        symbols,
        oauth,
    );
    let state = Arc::new(AppState {
        service,
        internal_api_key: config.internal_api_key.clone(),
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down upstream connection...");
    upstream.stop();

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
