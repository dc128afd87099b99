//! Scheduler background worker.
//!
//! Runs a scheduling pass on a fixed interval. Place and reservation
//! mutations also schedule inline, so the interval only bounds how long an
//! expiry can go unnoticed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument};

use crate::coordinator::Coordinator;

pub struct ScheduleWorker {
    coordinator: Arc<Coordinator>,
    interval: Duration,
}

impl ScheduleWorker {
    pub fn new(coordinator: Arc<Coordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting schedule worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.coordinator.schedule_reservations().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Schedule worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
