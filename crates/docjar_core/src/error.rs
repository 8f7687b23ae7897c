//! Error types for docjar core.

use crate::manager::TxnStatus;
use crate::types::ObjectRef;
use docjar_storage::{StorageError, Version};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in docjar core operations.
///
/// Every error raised while flushing or committing aborts the current
/// transaction before it is returned.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Backend error, surfaced unchanged.
    #[error(transparent)]
    Backend(#[from] StorageError),

    /// A document's class tag or shape does not fit the declared type.
    #[error("schema mismatch: {message}")]
    SchemaMismatch {
        /// Description of the mismatch.
        message: String,
    },

    /// A new object was referenced while cascading registration is off.
    #[error("reference to unsaved {class} object and cascading inserts are disabled")]
    UnassignedReference {
        /// Class of the unsaved object.
        class: String,
    },

    /// Eager resolution revisited an object that was still being resolved.
    #[error("circular reference: {}", .cycle.join(" -> "))]
    CircularReference {
        /// Objects on the cycle, the first one repeated at the end.
        cycle: Vec<String>,
    },

    /// The stored version of an object changed since it was loaded.
    #[error(
        "conflict on {object}: loaded version {}, stored version {}",
        show_version(.observed),
        show_version(.current)
    )]
    Conflict {
        /// The conflicting object.
        object: ObjectRef,
        /// Version observed when the object was loaded.
        observed: Option<Version>,
        /// Version currently stored, `None` if the row is gone.
        current: Option<Version>,
    },

    /// A removed object was mutated.
    #[error("{object} was removed in this transaction")]
    UseAfterRemove {
        /// Description of the removed object.
        object: String,
    },

    /// The row behind a reference no longer exists.
    #[error("object not found: {object}")]
    ObjectNotFound {
        /// The missing object.
        object: ObjectRef,
    },

    /// An object that already has an id was inserted again.
    #[error("{object} is already persistent")]
    AlreadyPersisted {
        /// The persistent object.
        object: ObjectRef,
    },

    /// An operation required a persistent object.
    #[error("{class} object is not persistent")]
    NotPersisted {
        /// Class of the transient object.
        class: String,
    },

    /// The transaction is not in a state that allows the operation.
    #[error("cannot {operation} while transaction is {status}")]
    InvalidState {
        /// Current transaction status.
        status: TxnStatus,
        /// The refused operation.
        operation: &'static str,
    },

    /// The savepoint was discarded or belongs to another transaction.
    #[error("unknown savepoint: {name}")]
    UnknownSavepoint {
        /// Name of the savepoint.
        name: String,
    },

    /// Operation not permitted for other reasons.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

fn show_version(version: &Option<Version>) -> String {
    version
        .as_ref()
        .map_or_else(|| "none".to_string(), ToString::to_string)
}

impl CoreError {
    /// Creates a schema mismatch error.
    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(status: TxnStatus, operation: &'static str) -> Self {
        Self::InvalidState { status, operation }
    }

    /// Creates an unknown savepoint error.
    pub fn unknown_savepoint(name: impl Into<String>) -> Self {
        Self::UnknownSavepoint { name: name.into() }
    }

    /// Returns true if retrying the whole transaction with fresh reads may
    /// succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
