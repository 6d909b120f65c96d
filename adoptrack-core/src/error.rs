//! Error types for adoptrack-core

use thiserror::Error;

/// Main error type for the adoptrack-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input, rejected before any state change
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An `after` snapshot arrived with nothing open to pair against
    #[error("no pending before snapshot for session {session_id}, file {file_path}")]
    NoPendingBefore {
        session_id: String,
        file_path: String,
    },

    /// Diff input exceeded the configured line ceiling
    #[error("diff too large: {lines} lines exceeds limit of {limit}")]
    DiffTooLarge { lines: usize, limit: usize },

    /// Transient storage failure; the caller should retry
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Edit event not found
    #[error("edit event not found: {0}")]
    EventNotFound(i64),
}

impl Error {
    /// Whether the operation may succeed if the caller retries it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                Error::StorageUnavailable(err.to_string())
            }
            _ => Error::Database(err),
        }
    }
}

/// Result type alias for adoptrack-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_storage_unavailable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let err = Error::from(busy);
        assert!(matches!(err, Error::StorageUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_other_sqlite_errors_are_not_retryable() {
        let err = Error::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, Error::Database(_)));
        assert!(!err.is_retryable());
    }
}
