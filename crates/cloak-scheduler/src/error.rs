//! Dispatch error types.

use cloak_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Panicked(String),
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
