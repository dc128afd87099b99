//! labhub coordinator
//!
//! Serves the coordinator gRPC API and drives the background workers that
//! schedule reservations, reconcile exporter state and persist places.

use std::sync::Arc;

use anyhow::Result;
use labhub_coordinator::{
    config,
    grpc::CoordinatorService,
    scheduler::ScheduleWorker,
    workers::{PersistWorker, SyncWorker},
    Coordinator,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to LABHUB_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = labhub_coordinator::VERSION, "Starting labhub coordinator");
    info!(
        listen_addr = %config.listen_addr,
        state_dir = ?config.coordinator.state_dir,
        "Configuration loaded"
    );

    let coordinator = match Coordinator::new(config.coordinator.clone()) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!(error = %e, "Failed to load state");
            return Err(e.into());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let schedule_worker = ScheduleWorker::new(
        Arc::clone(&coordinator),
        config.coordinator.schedule_interval,
    );
    let schedule_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            schedule_worker.run(shutdown_rx).await;
        }
    });

    let sync_worker = SyncWorker::new(Arc::clone(&coordinator), config.coordinator.sync_interval);
    let sync_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            sync_worker.run(shutdown_rx).await;
        }
    });

    let persist_worker =
        PersistWorker::new(Arc::clone(&coordinator), config.coordinator.save_interval);
    let persist_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            persist_worker.run(shutdown_rx).await;
        }
    });

    let service = CoordinatorService::new(Arc::clone(&coordinator)).into_server();
    let listen_addr = config.listen_addr;
    info!(addr = %listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_shutdown(listen_addr, async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("gRPC server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, schedule_handle).await {
        warn!(error = %e, "Schedule worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, sync_handle).await {
        warn!(error = %e, "Sync worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, persist_handle).await {
        warn!(error = %e, "Persist worker did not shut down in time");
    }

    if let Err(e) = coordinator.save().await {
        error!(error = %e, "Final save failed");
    }

    info!("Coordinator shutdown complete");
    Ok(())
}
