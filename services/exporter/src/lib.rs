//! labhub exporter library.
//!
//! Publishes locally attached lab resources to a coordinator and tracks
//! which place holds each of them.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod exporter;
pub mod resource;

pub use client::ExporterClient;
pub use error::ExporterError;
pub use exporter::ExporterState;
pub use resource::{Resource, ResourceRegistry};
