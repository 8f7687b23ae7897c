//! Identity map from references to live handles.

use crate::object::ObjectHandle;
use crate::types::ObjectRef;
use indexmap::IndexMap;

#[derive(Debug, Clone)]
struct Entry {
    handle: ObjectHandle,
    generation: u64,
}

/// Identity cache: at most one live handle per `(table, id)`.
///
/// Entries remember the generation they were last validated in. A data
/// manager whose cache outlives a transaction calls
/// [`begin_generation`](Self::begin_generation) at the boundary, which makes
/// every entry stale until it is revalidated against the store.
#[derive(Debug, Clone, Default)]
pub struct IdentityCache {
    entries: IndexMap<ObjectRef, Entry>,
    generation: u64,
}

impl IdentityCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached handle for a reference.
    #[must_use]
    pub fn get(&self, reference: &ObjectRef) -> Option<ObjectHandle> {
        self.entries.get(reference).map(|e| e.handle.clone())
    }

    /// Caches a handle and returns the canonical one.
    ///
    /// If a different handle is already cached for the reference, the
    /// cached handle wins and is returned.
    pub fn put(&mut self, reference: ObjectRef, handle: ObjectHandle) -> ObjectHandle {
        let generation = self.generation;
        self.entries
            .entry(reference)
            .or_insert(Entry { handle, generation })
            .handle
            .clone()
    }

    /// Removes a reference from the cache.
    pub fn evict(&mut self, reference: &ObjectRef) -> Option<ObjectHandle> {
        self.entries.shift_remove(reference).map(|e| e.handle)
    }

    /// Returns true if the reference is cached.
    #[must_use]
    pub fn contains(&self, reference: &ObjectRef) -> bool {
        self.entries.contains_key(reference)
    }

    /// Returns the number of cached handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterates over cached handles in insertion order.
    pub fn handles(&self) -> impl Iterator<Item = &ObjectHandle> {
        self.entries.values().map(|e| &e.handle)
    }

    /// Starts a new generation; all existing entries become stale.
    pub fn begin_generation(&mut self) {
        self.generation += 1;
    }

    /// Returns true if the entry was validated in the current generation.
    /// Unknown references are never current.
    #[must_use]
    pub fn is_current(&self, reference: &ObjectRef) -> bool {
        self.entries
            .get(reference)
            .is_some_and(|e| e.generation == self.generation)
    }

    /// Drops stale entries until at most `capacity` remain, oldest
    /// generation first. Entries validated in the current generation and
    /// handles held outside the cache are kept. Returns the number of
    /// entries dropped.
    pub fn prune(&mut self, capacity: usize) -> usize {
        let excess = self.entries.len().saturating_sub(capacity);
        if excess == 0 {
            return 0;
        }

        let current = self.generation;
        let mut candidates: Vec<(u64, ObjectRef)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.generation < current && !e.handle.is_shared())
            .map(|(r, e)| (e.generation, r.clone()))
            .collect();
        candidates.sort_by_key(|(generation, _)| *generation);

        let mut dropped = 0;
        for (_, reference) in candidates.into_iter().take(excess) {
            self.entries.shift_remove(&reference);
            dropped += 1;
        }
        dropped
    }

    /// Marks an entry as validated in the current generation.
    pub fn mark_current(&mut self, reference: &ObjectRef) {
        let generation = self.generation;
        if let Some(entry) = self.entries.get_mut(reference) {
            entry.generation = generation;
        }
    }
}
