//! Store error types.

use cloak_core::JobId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {id} has a corrupt record: {message}")]
    Corrupt { id: JobId, message: String },

    #[error("job directory already exists: {0}")]
    AlreadyExists(JobId),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<cloak_core::Error> for StoreError {
    fn from(err: cloak_core::Error) -> Self {
        match err {
            cloak_core::Error::Conflict(msg) => StoreError::InvalidTransition(msg),
            cloak_core::Error::InvalidInput(msg) => StoreError::InvalidInput(msg),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
