//! Storage error handling

use std::io;

use crate::compression::CompressionError;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by a storage backend
///
/// Missing items and tiles are never errors, they read as `None`.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("unknown SQL dialect '{0}'")]
    UnknownDialect(String),

    #[error("storage schema version {found} is newer than supported version {supported}")]
    SchemaVersion { found: i64, supported: i64 },

    #[error("invalid storage configuration: {0}")]
    Config(String),

    #[error("invalid {kind} '{name}'")]
    InvalidName { kind: &'static str, name: String },

    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    /// Whether the failure may go away when the operation is repeated
    ///
    /// Pool timeouts and busy or locked databases qualify; misconfiguration
    /// and malformed data never do.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Pool(_) => true,
            StorageError::Sql(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            StorageError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

pub(crate) fn invalid_name(kind: &'static str, name: &str) -> StorageError {
    StorageError::InvalidName {
        kind,
        name: name.to_string(),
    }
}

/// Create a configuration error
pub fn config_error(reason: impl Into<String>) -> StorageError {
    StorageError::Config(reason.into())
}
