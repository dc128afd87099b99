//! Coordinator stream client.
//!
//! On every (re)connect the exporter announces itself, sends its whole
//! resource tree and then answers `set_acquired_request`s until the stream
//! ends. Acquisition state survives reconnects, so the coordinator sees
//! which resources are still held and reconciles from there.

use labhub_proto::coordinator::v1::{self as pb, CoordinatorClient};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::error::Result;
use crate::exporter::ExporterState;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    Shutdown,
}

pub struct ExporterClient {
    url: String,
    state: ExporterState,
    backoff: BackoffPolicy,
}

impl ExporterClient {
    pub fn new(url: impl Into<String>, state: ExporterState) -> Self {
        Self {
            url: url.into(),
            state,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn state(&self) -> &ExporterState {
        &self.state
    }

    /// Stay connected until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(exporter = %self.state.name()))]
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt = 0u32;

        while !*shutdown.borrow() {
            match self.session(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed) => {
                    info!("Coordinator closed the stream");
                    attempt = 0;
                }
                Err(e) => warn!(error = %e, attempt, "Coordinator session failed"),
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Exporter client stopped");
    }

    async fn session(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd> {
        let mut client = CoordinatorClient::connect(self.url.clone()).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        for message in self.state.announce(VERSION) {
            let _ = tx.send(message);
        }
        let mut inbound = client
            .exporter_stream(UnboundedReceiverStream::new(rx))
            .await?
            .into_inner();
        info!(
            url = %self.url,
            resources = self.state.resource_count(),
            "Connected to coordinator"
        );

        loop {
            tokio::select! {
                message = inbound.message() => {
                    match message? {
                        Some(message) => self.handle(message, &tx),
                        None => return Ok(SessionEnd::Closed),
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
            }
        }
    }

    fn handle(
        &mut self,
        message: pb::ExporterOutMessage,
        tx: &mpsc::UnboundedSender<pb::ExporterInMessage>,
    ) {
        use pb::exporter_out_message::Kind;

        match message.kind {
            Some(Kind::Hello(hello)) => {
                info!(coordinator_version = %hello.version, "Coordinator hello");
            }
            Some(Kind::SetAcquiredRequest(request)) => {
                for reply in self.state.handle_request(&request) {
                    let _ = tx.send(reply);
                }
            }
            None => warn!("Empty message from coordinator"),
        }
    }
}
