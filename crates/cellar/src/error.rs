//! Error types for cellar
//!
//! Every failure is reported upward as a recoverable [`CellarError`]; the
//! caller decides whether to retry or abort.

use thiserror::Error;

/// Errors that can occur while writing to or reading from a cellar
#[derive(Debug, Error)]
pub enum CellarError {
    /// Physical read/write/flush/delete failure, tagged with the operation
    #[error("I/O error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Metadata store transaction failure
    #[error("Database error: {0}")]
    Database(String),

    /// Compression or cipher failure
    #[error("Transform error: {0}")]
    Transform(String),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The metadata store was closed with the writer
    #[error("Metadata store is closed")]
    Closed,

    /// Segment content that cannot be decoded as records
    #[error("Corrupt segment {segment}: {reason}")]
    Corrupt { segment: String, reason: String },

    /// A shared lock was poisoned by a panicking thread
    #[error("Lock poisoned: {0}")]
    Poisoned(&'static str),

    /// A background scan task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(String),
}

/// Result type for cellar operations
pub type Result<T> = std::result::Result<T, CellarError>;

impl CellarError {
    /// Create a new I/O error for the named operation
    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        Self::Io { op, source }
    }

    /// Create a new Transform error
    pub fn transform(message: impl Into<String>) -> Self {
        Self::Transform(message.into())
    }

    /// Create a new Corrupt error
    pub fn corrupt(segment: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            segment: segment.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error came from the filesystem reporting a missing file
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

impl From<tokio::task::JoinError> for CellarError {
    fn from(err: tokio::task::JoinError) -> Self {
        CellarError::Task(err.to_string())
    }
}

impl From<postcard::Error> for CellarError {
    fn from(err: postcard::Error) -> Self {
        CellarError::Deserialization(err.to_string())
    }
}

macro_rules! database_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for CellarError {
                fn from(err: $ty) -> Self {
                    CellarError::Database(err.to_string())
                }
            }
        )*
    };
}

database_error!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
