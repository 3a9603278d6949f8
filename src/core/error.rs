//! Application-wide error types.

use thiserror::Error;

use crate::saga::SagaError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("saga error: {0}")]
    Saga(#[from] SagaError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
