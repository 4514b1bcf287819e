use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("run {0} is already closed")]
    RunClosed(String),

    #[error("step index gap for run {run_id}: expected {expected}, got {got}")]
    StepIndexGap {
        run_id: String,
        expected: i64,
        got: i64,
    },
}
