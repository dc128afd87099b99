//! Periodic reconciliation and persistence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::coordinator::{Coordinator, SyncStats};

/// Re-aligns exporter-side acquisition with the places' view.
pub struct SyncWorker {
    coordinator: Arc<Coordinator>,
    interval: Duration,
}

impl SyncWorker {
    pub fn new(coordinator: Arc<Coordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting resource sync worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.coordinator.synchronize_resources().await;
                    if stats != SyncStats::default() {
                        info!(
                            released = stats.released,
                            acquired = stats.acquired,
                            replaced = stats.replaced,
                            failed = stats.failed,
                            conflicts = stats.conflicts,
                            "Resource sync complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Resource sync worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Writes the state directory when something changed.
pub struct PersistWorker {
    coordinator: Arc<Coordinator>,
    interval: Duration,
}

impl PersistWorker {
    pub fn new(coordinator: Arc<Coordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting persist worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.coordinator.save_if_dirty().await {
                        error!(error = %e, "Failed to save state");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Persist worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
