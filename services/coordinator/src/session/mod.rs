//! Per-stream state for connected exporters and clients.
//!
//! Sessions only hold transient references. The coordinator decides when a
//! session starts and ends and owns everything that outlives a stream.

mod client;
mod command;
mod exporter;

pub use client::{ClientRegistry, ClientSession, RESOURCE_BATCH_SIZE};
pub use command::{CommandError, PendingCommands};
pub(crate) use command::{outbound_stream, Outbound};
pub use exporter::{ExporterRegistry, ExporterSession, ResourceTree, SetResourceAction};
