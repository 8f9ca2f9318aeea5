//! Stream Relay Binary
//!
//! Entry point for the browser-to-SRT stream relay service.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use avstream_relay::{
    api::{build_router, AppState},
    config::{Config, LoggingConfig},
    metrics::Metrics,
    registry::ConnectionRegistry,
    server::{self, RelayServer},
    session::SessionSettings,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::var("RELAY_CONFIG").ok();
    let config = Config::load(config_path.as_deref())?;
    config.validate()?;
    let config = Arc::new(config);

    init_tracing(&config.logging);
    tracing::info!("Starting stream relay...");
    tracing::info!(
        "Configuration: WebSocket port={} path={}, HTTP port={}, encoder={}, max_connections={}",
        config.server.ws_port,
        config.server.ws_path,
        config.server.http_port,
        config.encoder.program,
        config.relay.max_connections
    );

    let metrics = Arc::new(Metrics::new());
    let registry = Arc::new(ConnectionRegistry::new(
        config.relay.max_connections,
        metrics.clone(),
    ));
    let settings = SessionSettings::from_config(&config)?;

    // Create shutdown signal channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Spawn WebSocket listener task
    let ws_listener = server::bind(&config.server).await?;
    let relay = Arc::new(RelayServer::new(
        &config,
        settings,
        registry.clone(),
        metrics.clone(),
    ));
    let ws_handle = tokio::spawn(relay.run(ws_listener, shutdown_tx.subscribe()));

    // Build HTTP router
    let state = AppState::new(registry.clone(), metrics.clone(), config.clone());
    let router = build_router(state);

    // Start HTTP server
    let bind_addr = format!("{}:{}", config.server.host, config.server.http_port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("HTTP server listening on {}", bind_addr);

    // Run the HTTP server with graceful shutdown on SIGTERM/SIGINT
    let shutdown_tx_clone = shutdown_tx.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, initiating graceful shutdown...");
            let _ = shutdown_tx_clone.send(());
        })
        .await?;

    // Stop accepting, then tear down every encoder
    let _ = shutdown_tx.send(());
    let _ = ws_handle.await;

    let relay_config = &config.relay;
    let drain_timeout = relay_config.stdin_grace()
        + relay_config.terminate_grace() * 2
        + Duration::from_secs(1);
    let remaining = registry.shutdown_all(drain_timeout).await;
    if remaining > 0 {
        tracing::warn!("{} connections still open at exit", remaining);
    }

    tracing::info!("Stream relay shutdown complete");
    Ok(())
}

/// Install the global subscriber; `RUST_LOG` wins over the configured filter
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.filter.as_str().into());
    let registry = tracing_subscriber::registry().with(filter);

    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
