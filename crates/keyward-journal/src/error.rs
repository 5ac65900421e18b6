use thiserror::Error;

/// Errors from write-ahead journal operations.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal segment not found: {0}")]
    SegmentNotFound(u64),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("journal is closed")]
    Closed,
}

impl From<serde_json::Error> for JournalError {
    fn from(e: serde_json::Error) -> Self {
        JournalError::Serialization(e.to_string())
    }
}
