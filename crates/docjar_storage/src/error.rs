//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while talking to a row store.
///
/// These are surfaced to callers of the data manager unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// A row operation was attempted outside of a transaction.
    #[error("no transaction is active on this connection")]
    NoTransaction,

    /// `begin` was called while a transaction is already open.
    #[error("a transaction is already active on this connection")]
    TransactionActive,

    /// An insert collided with an existing primary key.
    #[error("duplicate key {id} in table {table}")]
    UniqueViolation {
        /// Table of the colliding row.
        table: String,
        /// Primary key that already exists.
        id: String,
    },

    /// The transaction could not be serialized against a concurrent commit.
    #[error("could not serialize access to {table}/{id} due to concurrent update")]
    SerializationFailure {
        /// Table of the contended row.
        table: String,
        /// Primary key of the contended row.
        id: String,
    },

    /// The named savepoint does not exist in the current transaction.
    #[error("savepoint {0} does not exist")]
    UnknownSavepoint(String),

    /// The store cannot be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A filter expression could not be interpreted.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
}

impl StorageError {
    /// Creates a unique violation error.
    pub fn unique_violation(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self::UniqueViolation {
            table: table.into(),
            id: id.into(),
        }
    }

    /// Creates a serialization failure error.
    pub fn serialization_failure(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self::SerializationFailure {
            table: table.into(),
            id: id.into(),
        }
    }

    /// Creates an invalid filter error.
    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::InvalidFilter(message.into())
    }
}
