use thiserror::Error;
use tonic::Status;

use crate::model::ModelError;
use crate::session::CommandError;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Invalid(#[from] ModelError),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("exporter command for {resource} failed: {source}")]
    Exporter {
        resource: String,
        #[source]
        source: CommandError,
    },
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

impl From<CoordinatorError> for Status {
    fn from(err: CoordinatorError) -> Self {
        let message = err.to_string();
        match err {
            CoordinatorError::Invalid(_) | CoordinatorError::InvalidArgument(_) => {
                Status::invalid_argument(message)
            }
            CoordinatorError::NotFound(_) => Status::not_found(message),
            CoordinatorError::AlreadyExists(_) => Status::already_exists(message),
            CoordinatorError::FailedPrecondition(_) => Status::failed_precondition(message),
            CoordinatorError::PermissionDenied(_) => Status::permission_denied(message),
            CoordinatorError::Exporter { source, .. } => match source {
                CommandError::Expired => Status::deadline_exceeded(message),
                CommandError::Disconnected | CommandError::Unknown => {
                    Status::unavailable(message)
                }
                CommandError::Rejected(_) => Status::failed_precondition(message),
            },
        }
    }
}
