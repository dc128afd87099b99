//! labhub exporter
//!
//! Reads a YAML resource description, connects to the coordinator and keeps
//! the connection alive until ctrl-c.

use anyhow::{Context, Result};
use labhub_exporter::{
    config, resource::load_resources, ExporterClient, ExporterState, ResourceRegistry,
};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to LABHUB_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        name = %config.name,
        coordinator_url = %config.coordinator_url,
        resources_path = ?config.resources_path,
        "Starting labhub exporter"
    );

    let registry = ResourceRegistry::with_builtins();
    let groups = match &config.resources_path {
        Some(path) => load_resources(path, &registry)
            .with_context(|| format!("loading resources from {}", path.display()))?,
        None => {
            warn!("LABHUB_EXPORTER_CONFIG not set, exporting no resources");
            Default::default()
        }
    };

    let state = ExporterState::new(config.name.clone(), groups);
    info!(resources = state.resource_count(), "Resources loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut client = ExporterClient::new(config.coordinator_url.clone(), state);
    let client_handle = tokio::spawn(async move {
        client.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    if let Err(e) = tokio::time::timeout(std::time::Duration::from_secs(10), client_handle).await {
        warn!(error = %e, "Exporter client did not shut down in time");
    }

    info!("Exporter shutdown complete");
    Ok(())
}
