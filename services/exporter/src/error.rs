use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unknown resource class '{0}'")]
    UnknownClass(String),

    #[error("invalid parameters for {cls}: {source}")]
    InvalidParams {
        cls: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("resource {group}/{name} is not exported")]
    UnknownResource { group: String, name: String },

    #[error("resource {resource} is already acquired by {holder}")]
    AlreadyAcquired { resource: String, holder: String },

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("coordinator closed the stream: {0}")]
    Rejected(#[from] tonic::Status),
}

pub type Result<T> = std::result::Result<T, ExporterError>;
