//! Configuration for the exporter.

use std::path::PathBuf;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    /// Coordinator gRPC URL.
    pub coordinator_url: String,

    /// Name announced at startup. Must be unique per coordinator.
    pub name: String,

    /// YAML file describing the exported resources.
    pub resources_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let coordinator_url = std::env::var("LABHUB_COORDINATOR_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:20408".to_string());

        let name = std::env::var("LABHUB_EXPORTER_NAME")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "exporter".to_string());

        let resources_path = std::env::var("LABHUB_EXPORTER_CONFIG")
            .ok()
            .map(PathBuf::from);

        let log_level = std::env::var("LABHUB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            coordinator_url,
            name,
            resources_path,
            log_level,
        })
    }
}
