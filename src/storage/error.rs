//! Error types for record store and server directory operations

use crate::model::{AlertId, RuleId, ServerId};

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while talking to the record store or directory
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database connection failed
    #[error("failed to connect to storage backend: {0}")]
    ConnectionFailed(String),

    /// Database query failed
    #[error("storage query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("database migration failed: {0}")]
    MigrationFailed(String),

    /// An open alert already exists for this server/rule pair
    #[error("an open alert already exists for server '{server_id}' and rule {rule_id}")]
    Conflict { server_id: ServerId, rule_id: RuleId },

    /// Referenced server is not registered
    #[error("unknown server '{0}'")]
    UnknownServer(ServerId),

    /// Referenced alert does not exist
    #[error("unknown alert {0}")]
    UnknownAlert(AlertId),

    /// A stored row could not be mapped back to a domain type
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// The store or directory is temporarily unreachable
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    /// Payload serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// I/O error (file access, etc.)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl StorageError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::ConnectionFailed(_)
                | StorageError::Unavailable(_)
                | StorageError::IoError(_)
        )
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io_err) => StorageError::IoError(io_err),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StorageError::Unavailable(err.to_string())
            }
            sqlx::Error::RowNotFound => StorageError::QueryFailed("no rows found".to_string()),
            _ => StorageError::QueryFailed(err.to_string()),
        }
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::MigrationFailed(err.to_string())
    }
}
