//! labhub coordinator library.
//!
//! This crate primarily ships a `coordinator` binary, but we expose the
//! library surface so that integration tests can drive it in-process.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod grpc;
pub mod model;
pub mod persistence;
pub mod scheduler;
pub mod session;
pub mod workers;

pub use coordinator::{Coordinator, SyncStats, VERSION};
