use std::path::PathBuf;
use std::time::Duration;

use vouch::config::Configuration;
use vouch::{app, initialize_state, telemetry};

/// Interval between purges of expired tokens and codes.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let otlp = telemetry::setup_tracing(std::io::stdout);

    let mut config = Configuration::default();
    if let Some(path) = std::env::args().nth(1) {
        config = config.path(PathBuf::from(path));
    }
    let config = config.read()?;

    let mut state = initialize_state(config.clone()).await?;
    match telemetry::setup_metrics_recorder() {
        Ok(handle) => state.metrics = Some(handle),
        Err(err) => tracing::warn!(error = %err, "metrics disabled"),
    }

    let storage = state.storage.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            storage.purge_expired().await;
        }
    });

    let plugin = state.plugin.clone();
    let listener = tokio::net::TcpListener::bind(&config.address).await?;
    tracing::info!(address = %config.address, "server started");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(plugin) = plugin {
        plugin.shutdown().await;
    }
    if let Some(otlp) = otlp {
        otlp.shutdown();
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
