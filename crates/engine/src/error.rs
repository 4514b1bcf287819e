use thiserror::Error;

use docreason_store::StoreError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("run {0} not found")]
    RunNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
