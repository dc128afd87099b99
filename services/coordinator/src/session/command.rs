//! Acquire/release commands sent to an exporter.
//!
//! Exporters answer commands strictly in order, one response per command,
//! so a response is correlated with the oldest command still waiting. A
//! command whose caller gave up stays in the queue until its response
//! arrives; that response is then dropped with a warning.

use std::collections::VecDeque;
use std::sync::Arc;

use labhub_id::RequestId;
use labhub_proto::coordinator::v1 as pb;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("exporter did not answer in time")]
    Expired,

    #[error("exporter disconnected")]
    Disconnected,

    #[error("exporter is not connected")]
    Unknown,

    #[error("exporter rejected the command: {0}")]
    Rejected(String),
}

pub(crate) type Reply = oneshot::Sender<Result<(), CommandError>>;

pub(crate) struct ExporterCommand {
    pub id: RequestId,
    pub request: pb::ExporterSetAcquiredRequest,
    pub reply: Reply,
}

/// Items feeding an exporter's outbound stream.
pub(crate) enum Outbound {
    Command(ExporterCommand),
    /// Terminate the stream with an error status.
    Abort(Status),
}

/// Commands handed to the exporter and still waiting for a response.
#[derive(Clone, Default)]
pub struct PendingCommands {
    inner: Arc<Mutex<VecDeque<(RequestId, Reply)>>>,
}

impl PendingCommands {
    fn push(&self, id: RequestId, reply: Reply) {
        self.inner.lock().push_back((id, reply));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Resolve the oldest pending command with an exporter response.
    pub fn complete(&self, response: pb::ExporterResponse) {
        let Some((id, reply)) = self.inner.lock().pop_front() else {
            warn!(success = response.success, "Exporter response without a pending command");
            return;
        };

        let result = if response.success {
            Ok(())
        } else {
            Err(CommandError::Rejected(
                response.reason.unwrap_or_else(|| "no reason given".to_string()),
            ))
        };

        if reply.send(result).is_err() {
            warn!(request_id = %id, "Discarding late response to an expired command");
        } else {
            debug!(request_id = %id, success = response.success, "Exporter command completed");
        }
    }

    /// Drop every waiting command; callers observe a disconnect.
    pub fn fail_all(&self) {
        let drained: Vec<_> = self.inner.lock().drain(..).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Failing pending exporter commands");
        }
    }
}

/// Build the stream returned to an exporter: `hello`, then commands.
///
/// `close_guard` is dropped together with the stream, which tells the
/// session supervisor that the transport is gone.
pub(crate) fn outbound_stream(
    version: String,
    rx: mpsc::UnboundedReceiver<Outbound>,
    pending: PendingCommands,
    close_guard: oneshot::Sender<()>,
) -> impl Stream<Item = Result<pb::ExporterOutMessage, Status>> + Send + 'static {
    use pb::exporter_out_message::Kind;

    let hello = tokio_stream::once(Ok(pb::ExporterOutMessage {
        kind: Some(Kind::Hello(pb::Hello { version })),
    }));

    let commands = UnboundedReceiverStream::new(rx).filter_map(move |out| {
        let _close_guard = &close_guard;
        match out {
            Outbound::Command(cmd) => {
                if cmd.reply.is_closed() {
                    debug!(request_id = %cmd.id, "Skipping command abandoned before delivery");
                    return None;
                }
                let message = pb::ExporterOutMessage {
                    kind: Some(Kind::SetAcquiredRequest(cmd.request)),
                };
                pending.push(cmd.id, cmd.reply);
                Some(Ok(message))
            }
            Outbound::Abort(status) => Some(Err(status)),
        }
    });

    hello.chain(commands)
}
