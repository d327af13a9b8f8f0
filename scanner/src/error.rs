//! Error types for the scanner

use thiserror::Error;

use crate::chain_client::FetchError;
use crate::database::gateway::PersistError;

#[derive(Error, Debug)]
pub enum ScannerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("persist error: {0}")]
    Persist(#[from] PersistError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("non-monotonic checkpoint advance: checkpoint is {current}, refusing {requested}")]
    NonMonotonicAdvance { current: i64, requested: i64 },

    #[error("corrupt scan checkpoint: {0}")]
    CorruptCheckpoint(String),
}

pub type Result<T> = std::result::Result<T, ScannerError>;

impl ScannerError {
    /// Fatal errors stop the scanner and require operator intervention;
    /// everything else is retried from the last committed checkpoint.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScannerError::NonMonotonicAdvance { .. }
                | ScannerError::CorruptCheckpoint(_)
                | ScannerError::Config(_)
        )
    }
}
