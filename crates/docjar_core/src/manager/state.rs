//! Transaction state.

use crate::cache::IdentityCache;
use crate::conflict::ConflictDetector;
use crate::object::{CellSnapshot, HandleKey, ObjectHandle};
use crate::types::TransactionId;
use indexmap::IndexMap;
use std::fmt;

/// Status of a data manager's current transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Transaction is active and can perform operations.
    Active,
    /// Pending changes are being flushed for the vote.
    Voting,
    /// The backend commit is in progress.
    Committing,
    /// Transaction has been committed.
    Committed,
    /// The transaction is being rolled back.
    Aborting,
    /// Transaction has been aborted.
    Aborted,
}

impl TxnStatus {
    /// Returns true for `Committed` and `Aborted`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Voting => "voting",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
        })
    }
}

/// Objects a transaction has to write or undo.
#[derive(Debug, Clone, Default)]
pub(crate) struct TransactionState {
    /// New or modified objects waiting for the next flush.
    registered: IndexMap<HandleKey, ObjectHandle>,
    /// Removed objects waiting for the next flush.
    removed: IndexMap<HandleKey, ObjectHandle>,
    /// Objects that received their id in this transaction.
    assigned: IndexMap<HandleKey, ObjectHandle>,
    /// Every object registered, removed or written in this transaction.
    touched: IndexMap<HandleKey, ObjectHandle>,
}

impl TransactionState {
    /// Registers an object. Returns false if it was already registered.
    pub(crate) fn register(&mut self, handle: &ObjectHandle) -> bool {
        self.touch(handle);
        self.registered
            .insert(handle.key(), handle.clone())
            .is_none()
    }

    pub(crate) fn unregister(&mut self, handle: &ObjectHandle) {
        self.registered.shift_remove(&handle.key());
    }

    pub(crate) fn is_registered(&self, handle: &ObjectHandle) -> bool {
        self.registered.contains_key(&handle.key())
    }

    pub(crate) fn registered(&self) -> impl Iterator<Item = &ObjectHandle> {
        self.registered.values()
    }

    /// Moves an object from the registered set to the pending removals.
    pub(crate) fn remove(&mut self, handle: &ObjectHandle) {
        self.unregister(handle);
        self.touch(handle);
        self.removed.insert(handle.key(), handle.clone());
    }

    pub(crate) fn removed(&self) -> impl Iterator<Item = &ObjectHandle> {
        self.removed.values()
    }

    pub(crate) fn note_assigned(&mut self, handle: &ObjectHandle) {
        self.touch(handle);
        self.assigned.insert(handle.key(), handle.clone());
    }

    pub(crate) fn forget_assigned(&mut self, handle: &ObjectHandle) {
        self.assigned.shift_remove(&handle.key());
    }

    pub(crate) fn was_assigned(&self, handle: &ObjectHandle) -> bool {
        self.assigned.contains_key(&handle.key())
    }

    pub(crate) fn assigned(&self) -> impl Iterator<Item = &ObjectHandle> {
        self.assigned.values()
    }

    pub(crate) fn touch(&mut self, handle: &ObjectHandle) {
        self.touched
            .entry(handle.key())
            .or_insert_with(|| handle.clone());
    }

    pub(crate) fn touched(&self) -> impl Iterator<Item = &ObjectHandle> {
        self.touched.values()
    }

    /// Every object the state refers to.
    pub(crate) fn handles(&self) -> impl Iterator<Item = &ObjectHandle> {
        self.registered
            .values()
            .chain(self.removed.values())
            .chain(self.assigned.values())
            .chain(self.touched.values())
    }

    /// Drops pending work after a successful flush.
    pub(crate) fn clear_pending(&mut self) {
        self.registered.clear();
        self.removed.clear();
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.registered.len() + self.removed.len()
    }
}

/// A rollback point inside a transaction.
///
/// Returned by [`DataManager::savepoint`](crate::DataManager::savepoint).
/// It stays usable after being rolled back to, and becomes unknown once the
/// transaction ends or an earlier savepoint is rolled back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) txn: TransactionId,
}

impl Savepoint {
    /// Returns the savepoint name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the transaction the savepoint belongs to.
    #[must_use]
    pub fn transaction(&self) -> TransactionId {
        self.txn
    }
}

/// Everything needed to return to a savepoint.
#[derive(Debug)]
pub(crate) struct SavepointFrame {
    pub(crate) id: u64,
    pub(crate) backend_name: String,
    pub(crate) state: TransactionState,
    pub(crate) cache: IdentityCache,
    pub(crate) detector: ConflictDetector,
    pub(crate) objects: Vec<(ObjectHandle, CellSnapshot)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectRef;

    #[test]
    fn terminal_states() {
        assert!(TxnStatus::Committed.is_terminal());
        assert!(TxnStatus::Aborted.is_terminal());
        assert!(!TxnStatus::Voting.is_terminal());
        assert_eq!(TxnStatus::Committing.to_string(), "committing");
    }

    #[test]
    fn register_is_idempotent() {
        let mut state = TransactionState::default();
        let h = ObjectHandle::new("Foo");
        assert!(state.register(&h));
        assert!(!state.register(&h.clone()));
        assert_eq!(state.registered().count(), 1);
        assert_eq!(state.touched().count(), 1);
    }

    #[test]
    fn remove_moves_out_of_registered() {
        let mut state = TransactionState::default();
        let h = ObjectHandle::new("Foo");
        h.assign(&ObjectRef::new("foo", "1"));
        state.register(&h);
        state.remove(&h);
        assert!(!state.is_registered(&h));
        assert_eq!(state.removed().count(), 1);
        assert_eq!(state.pending_count(), 1);

        state.clear_pending();
        assert_eq!(state.pending_count(), 0);
        assert_eq!(state.touched().count(), 1);
    }

    #[test]
    fn assigned_tracking() {
        let mut state = TransactionState::default();
        let h = ObjectHandle::new("Foo");
        state.note_assigned(&h);
        assert!(state.was_assigned(&h));
        state.forget_assigned(&h);
        assert!(!state.was_assigned(&h));
    }
}
