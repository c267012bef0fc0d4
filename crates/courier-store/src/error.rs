use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store refused the operation for this caller.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The store is temporarily unreachable or overloaded.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// The blocking task running a query panicked or was cancelled.
    #[error("Store task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Whether the error means "the store is degraded" rather than "the
    /// request is wrong". Real-time delivery continues through degraded
    /// errors.
    pub fn is_degraded(&self) -> bool {
        match self {
            StoreError::PermissionDenied(_) | StoreError::Unavailable(_) => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::PermissionDenied
                    | rusqlite::ErrorCode::ReadOnly
                    | rusqlite::ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Task(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_classification() {
        assert!(StoreError::PermissionDenied("rules".into()).is_degraded());
        assert!(StoreError::Unavailable("timeout".into()).is_degraded());
        assert!(!StoreError::NotFound.is_degraded());
        assert!(!StoreError::Migration("bad".into()).is_degraded());

        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(StoreError::Sqlite(busy).is_degraded());
        assert!(!StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows).is_degraded());
    }
}
