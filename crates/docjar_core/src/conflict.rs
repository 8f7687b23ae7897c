//! Optimistic conflict detection.

use crate::error::CoreError;
use crate::types::ObjectRef;
use docjar_storage::Version;
use std::collections::HashMap;
use std::fmt;

/// A detected write-write conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// The conflicting object.
    pub object: ObjectRef,
    /// Version observed at load.
    pub observed: Option<Version>,
    /// Version stored now, `None` if the row is gone.
    pub current: Option<Version>,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conflict on {}", self.object)
    }
}

impl From<Conflict> for CoreError {
    fn from(c: Conflict) -> Self {
        Self::Conflict {
            object: c.object,
            observed: c.observed,
            current: c.current,
        }
    }
}

/// Records the version of every object as first seen by the transaction and
/// checks it against the stored version at commit.
///
/// `None` means the object is new in this transaction. New objects never
/// conflict; their insert fails in the backend instead if the key is taken.
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    observed: HashMap<ObjectRef, Option<Version>>,
}

impl ConflictDetector {
    /// Creates an empty detector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the version observed when an object was loaded, or `None`
    /// for a new object.
    pub fn record_load(&mut self, object: ObjectRef, version: Option<Version>) {
        self.observed.insert(object, version);
    }

    /// Re-bases an object after this transaction wrote it.
    pub fn record_write(&mut self, object: ObjectRef, version: Version) {
        self.observed.insert(object, Some(version));
    }

    /// Returns what was recorded for an object: `None` if nothing was,
    /// `Some(None)` for a new object.
    #[must_use]
    pub fn observed(&self, object: &ObjectRef) -> Option<&Option<Version>> {
        self.observed.get(object)
    }

    /// Drops an object.
    pub fn forget(&mut self, object: &ObjectRef) {
        self.observed.remove(object);
    }

    /// Returns the number of tracked objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observed.len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.observed.clear();
    }

    /// Compares the recorded version of `object` with `current`.
    ///
    /// # Errors
    ///
    /// Returns a [`Conflict`] if the object was loaded at a version other
    /// than `current`, or its row is gone.
    pub fn check_at_commit(
        &self,
        object: &ObjectRef,
        current: Option<&Version>,
    ) -> Result<(), Conflict> {
        match self.observed.get(object) {
            None | Some(None) => Ok(()),
            Some(Some(seen)) if Some(seen) == current => Ok(()),
            Some(seen) => Err(Conflict {
                object: object.clone(),
                observed: seen.clone(),
                current: current.cloned(),
            }),
        }
    }
}
