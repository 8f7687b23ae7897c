//! Backend trait definition.

use crate::error::StorageResult;
use crate::filter::Filter;
use crate::row::{Document, ObjectId, Row, Version, WriteOutcome};

/// A connection to a document-capable row store.
///
/// A backend exposes table-scoped rows keyed by [`ObjectId`], each holding a
/// JSON [`Document`] and a [`Version`] column used purely for optimistic
/// comparison. The store must run transactions at SERIALIZABLE isolation.
///
/// One connection carries at most one transaction at a time, and callers
/// issue one operation at a time.
///
/// # Invariants
///
/// - Row operations require an open transaction (`begin` was called).
/// - Nothing written inside a transaction is visible to other connections
///   before `commit` returns successfully.
/// - `update_row` and `delete_row` never write when `expected` is given and
///   does not match the stored version; they report
///   [`WriteOutcome::Conflict`] instead.
/// - `commit` either applies every write of the transaction or none.
pub trait Backend: Send {
    /// Opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if a transaction is already open or the store is
    /// unreachable.
    fn begin(&mut self) -> StorageResult<()>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be serialized against
    /// concurrent commits, or the store is unreachable. The transaction is
    /// closed either way.
    fn commit(&mut self) -> StorageResult<()>;

    /// Rolls back the open transaction. Rolling back with no open
    /// transaction is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    fn rollback(&mut self) -> StorageResult<()>;

    /// Creates a named savepoint in the open transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if no transaction is open.
    fn create_savepoint(&mut self, name: &str) -> StorageResult<()>;

    /// Reverts the open transaction to a savepoint. The savepoint itself
    /// stays valid; savepoints created after it are released.
    ///
    /// # Errors
    ///
    /// Returns an error if the savepoint does not exist.
    fn rollback_to_savepoint(&mut self, name: &str) -> StorageResult<()>;

    /// Fetches one row.
    ///
    /// # Errors
    ///
    /// Returns an error if no transaction is open or the store fails.
    fn fetch_row(&mut self, table: &str, id: &ObjectId) -> StorageResult<Option<Row>>;

    /// Inserts a new row and returns its initial version.
    ///
    /// # Errors
    ///
    /// Returns a unique violation if the key already exists.
    fn insert_row(&mut self, table: &str, id: &ObjectId, document: Document)
        -> StorageResult<Version>;

    /// Replaces a row's document.
    ///
    /// With `expected` set, the write only happens if the stored version
    /// equals it. `None` writes unconditionally if the row exists.
    ///
    /// # Errors
    ///
    /// Returns an error if no transaction is open or the store fails.
    fn update_row(
        &mut self,
        table: &str,
        id: &ObjectId,
        document: Document,
        expected: Option<&Version>,
    ) -> StorageResult<WriteOutcome<Version>>;

    /// Deletes a row, conditionally on `expected` like [`Backend::update_row`].
    ///
    /// # Errors
    ///
    /// Returns an error if no transaction is open or the store fails.
    fn delete_row(
        &mut self,
        table: &str,
        id: &ObjectId,
        expected: Option<&Version>,
    ) -> StorageResult<WriteOutcome<()>>;

    /// Returns every row of `table` whose document matches `filter`,
    /// ordered by primary key.
    ///
    /// # Errors
    ///
    /// Returns an error if no transaction is open or the store fails.
    fn query(&mut self, table: &str, filter: &Filter) -> StorageResult<Vec<Row>>;

    /// Returns true if a transaction is open on this connection.
    fn in_transaction(&self) -> bool;
}
