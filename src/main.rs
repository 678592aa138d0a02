//! Rotunnel - Entry Point
//!
//! Starts the tunnel engine with graceful shutdown support.

use anyhow::Context;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rotunnel::config::{Config, LogConfig};
use rotunnel::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config.log);

    info!("Starting Rotunnel");

    let engine = Engine::new(config.tunnel.clone());
    engine
        .start()
        .await
        .context("failed to start tunnel engine")?;

    if let Some(endpoint) = engine.current_endpoint() {
        info!("Current endpoint: {}", endpoint);
    }

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    engine.stop().await;

    let stats = serde_json::to_string(&engine.stats()).context("failed to encode stats")?;
    info!("Final stats: {}", stats);

    info!("Rotunnel stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rotunnel={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
