//! Shared handles to persistent objects.

use crate::error::{CoreError, CoreResult};
use crate::object::value::{Attributes, Value};
use crate::types::ObjectRef;
use docjar_storage::{Document, ObjectId, Version};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Whether an object's attributes are in memory.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    /// Only the reference is known; attributes load on first access.
    Hollow,
    /// Attributes are in memory.
    Loaded(Attributes),
}

#[derive(Debug, Clone)]
pub(crate) struct ObjectCell {
    class: String,
    table: Option<String>,
    id: Option<ObjectId>,
    slot: Slot,
    dirty: bool,
    removed: bool,
    version: Option<Version>,
    /// Document as last read from or written to the backend.
    stored: Option<Document>,
}

/// Saved copy of a handle's state, used by savepoints.
pub(crate) type CellSnapshot = ObjectCell;

/// Identity key of a handle allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HandleKey(usize);

/// Shared handle to one persistent object.
///
/// Cloning a handle yields another pointer to the same object. Two handles
/// are equal when they point to the same allocation, or when both are
/// persistent and name the same `(table, id)`.
///
/// A handle is either loaded or hollow. Hollow handles come from references
/// that have not been followed yet; reading or writing their attributes
/// goes through [`DataManager`](crate::DataManager), which loads them on
/// first access.
///
/// Handles that reference each other form `Arc` cycles and are only freed
/// once one of the references is cleared.
#[derive(Clone)]
pub struct ObjectHandle(Arc<Mutex<ObjectCell>>);

impl ObjectHandle {
    /// Creates a new, transient object of the given class.
    pub fn new(class: impl Into<String>) -> Self {
        Self::from_cell(ObjectCell {
            class: class.into(),
            table: None,
            id: None,
            slot: Slot::Loaded(Attributes::new()),
            dirty: false,
            removed: false,
            version: None,
            stored: None,
        })
    }

    /// Sets an attribute on a freshly created object.
    #[must_use]
    pub fn with(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Slot::Loaded(attrs) = &mut self.0.lock().slot {
            attrs.insert(name.into(), value.into());
        }
        self
    }

    pub(crate) fn hollow(class: impl Into<String>, reference: &ObjectRef) -> Self {
        Self::from_cell(ObjectCell {
            class: class.into(),
            table: Some(reference.table.clone()),
            id: Some(reference.id.clone()),
            slot: Slot::Hollow,
            dirty: false,
            removed: false,
            version: None,
            stored: None,
        })
    }

    fn from_cell(cell: ObjectCell) -> Self {
        Self(Arc::new(Mutex::new(cell)))
    }

    /// Returns the class name. Hollow handles report their table's base
    /// class until loaded.
    #[must_use]
    pub fn class(&self) -> String {
        self.0.lock().class.clone()
    }

    /// Returns the id, once assigned.
    #[must_use]
    pub fn id(&self) -> Option<ObjectId> {
        self.0.lock().id.clone()
    }

    /// Returns the table, once assigned.
    #[must_use]
    pub fn table(&self) -> Option<String> {
        self.0.lock().table.clone()
    }

    /// Returns the reference placeholder for this object, once assigned.
    #[must_use]
    pub fn object_ref(&self) -> Option<ObjectRef> {
        let cell = self.0.lock();
        match (&cell.table, &cell.id) {
            (Some(table), Some(id)) => Some(ObjectRef::new(table.clone(), id.clone())),
            _ => None,
        }
    }

    /// Returns true once the object has an id.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.0.lock().id.is_some()
    }

    /// Returns true if attributes are not loaded yet.
    #[must_use]
    pub fn is_hollow(&self) -> bool {
        matches!(self.0.lock().slot, Slot::Hollow)
    }

    /// Returns true if the object was mutated since it was last written.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.0.lock().dirty
    }

    /// Returns true if the object was removed.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.0.lock().removed
    }

    /// Returns the last known stored version.
    #[must_use]
    pub fn version(&self) -> Option<Version> {
        self.0.lock().version.clone()
    }

    /// Returns true if both handles point to the same allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Returns true if another clone of this handle is alive.
    pub(crate) fn is_shared(&self) -> bool {
        Arc::strong_count(&self.0) > 1
    }

    /// Reads an attribute.
    ///
    /// # Errors
    ///
    /// Fails if the handle is hollow.
    pub fn get(&self, name: &str) -> CoreResult<Option<Value>> {
        let cell = self.0.lock();
        match &cell.slot {
            Slot::Loaded(attrs) => Ok(attrs.get(name).cloned()),
            Slot::Hollow => Err(not_loaded(&cell)),
        }
    }

    /// Writes an attribute and marks the object dirty.
    ///
    /// # Errors
    ///
    /// Fails if the object was removed or the handle is hollow.
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) -> CoreResult<()> {
        let mut cell = self.0.lock();
        if cell.removed {
            return Err(CoreError::UseAfterRemove {
                object: describe(&cell),
            });
        }
        let cell = &mut *cell;
        let Slot::Loaded(attrs) = &mut cell.slot else {
            return Err(not_loaded(cell));
        };
        attrs.insert(name.into(), value.into());
        cell.dirty = true;
        Ok(())
    }

    /// Deletes an attribute and marks the object dirty.
    ///
    /// # Errors
    ///
    /// Fails if the object was removed or the handle is hollow.
    pub fn unset(&self, name: &str) -> CoreResult<Option<Value>> {
        let mut cell = self.0.lock();
        if cell.removed {
            return Err(CoreError::UseAfterRemove {
                object: describe(&cell),
            });
        }
        let cell = &mut *cell;
        let Slot::Loaded(attrs) = &mut cell.slot else {
            return Err(not_loaded(cell));
        };
        let old = attrs.remove(name);
        cell.dirty = true;
        Ok(old)
    }

    /// Returns a copy of all attributes.
    ///
    /// # Errors
    ///
    /// Fails if the handle is hollow.
    pub fn attributes(&self) -> CoreResult<Attributes> {
        let cell = self.0.lock();
        match &cell.slot {
            Slot::Loaded(attrs) => Ok(attrs.clone()),
            Slot::Hollow => Err(not_loaded(&cell)),
        }
    }

    /// Returns every handle referenced from this object's attributes.
    ///
    /// # Errors
    ///
    /// Fails if the handle is hollow.
    pub fn references(&self) -> CoreResult<Vec<ObjectHandle>> {
        let attrs = self.attributes()?;
        let mut out = Vec::new();
        for value in attrs.values() {
            value.collect_refs(&mut out);
        }
        Ok(out)
    }

    pub(crate) fn key(&self) -> HandleKey {
        HandleKey(Arc::as_ptr(&self.0) as usize)
    }

    /// Short label such as `person/42` or `new Person`.
    pub(crate) fn describe(&self) -> String {
        describe(&self.0.lock())
    }

    pub(crate) fn stored_document(&self) -> Option<Document> {
        self.0.lock().stored.clone()
    }

    pub(crate) fn assign(&self, reference: &ObjectRef) {
        let mut cell = self.0.lock();
        cell.table = Some(reference.table.clone());
        cell.id = Some(reference.id.clone());
    }

    /// Turns the object back into a transient one.
    pub(crate) fn strip_id(&self) {
        let mut cell = self.0.lock();
        cell.table = None;
        cell.id = None;
        cell.version = None;
        cell.stored = None;
        cell.removed = false;
        cell.dirty = true;
    }

    /// Populates the handle from a stored row.
    pub(crate) fn load(
        &self,
        class: String,
        attributes: Attributes,
        version: Version,
        document: Document,
    ) {
        let mut cell = self.0.lock();
        cell.class = class;
        cell.slot = Slot::Loaded(attributes);
        cell.version = Some(version);
        cell.stored = Some(document);
        cell.dirty = false;
    }

    /// Records a successful write of `document` at `version`.
    pub(crate) fn mark_written(&self, version: Version, document: Document) {
        let mut cell = self.0.lock();
        cell.version = Some(version);
        cell.stored = Some(document);
        cell.dirty = false;
    }

    pub(crate) fn mark_clean(&self) {
        self.0.lock().dirty = false;
    }

    pub(crate) fn set_removed(&self, removed: bool) {
        self.0.lock().removed = removed;
    }

    pub(crate) fn snapshot(&self) -> CellSnapshot {
        self.0.lock().clone()
    }

    pub(crate) fn restore(&self, snapshot: CellSnapshot) {
        *self.0.lock() = snapshot;
    }
}

fn describe(cell: &ObjectCell) -> String {
    match (&cell.table, &cell.id) {
        (Some(table), Some(id)) => format!("{table}/{id}"),
        _ => format!("new {}", cell.class),
    }
}

fn not_loaded(cell: &ObjectCell) -> CoreError {
    CoreError::invalid_operation(format!(
        "{} is not loaded; read it through the data manager",
        describe(cell)
    ))
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match (self.object_ref(), other.object_ref()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Attributes may reference this handle again, so only the identity
        // is printed.
        match self.0.try_lock() {
            Some(cell) => f
                .debug_struct("ObjectHandle")
                .field("class", &cell.class)
                .field("id", &cell.id)
                .finish_non_exhaustive(),
            None => f.write_str("ObjectHandle(<locked>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(id: &str) -> ObjectRef {
        ObjectRef::new("foo", id)
    }

    #[test]
    fn new_handle_is_transient_and_loaded() {
        let h = ObjectHandle::new("Foo").with("name", "foo");
        assert!(!h.is_persistent());
        assert!(!h.is_hollow());
        assert!(!h.is_dirty());
        assert_eq!(h.get("name").unwrap(), Some(Value::from("foo")));
        assert!(h.object_ref().is_none());
    }

    #[test]
    fn set_marks_dirty() {
        let h = ObjectHandle::new("Foo");
        h.set("n", 1).unwrap();
        assert!(h.is_dirty());
        assert_eq!(h.unset("n").unwrap(), Some(Value::Int(1)));
    }

    #[test]
    fn hollow_handle_refuses_attribute_access() {
        let h = ObjectHandle::hollow("Foo", &reference("1"));
        assert!(h.is_hollow());
        assert!(matches!(
            h.get("x"),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(h.set("x", 1).is_err());
    }

    #[test]
    fn removed_handle_refuses_mutation() {
        let h = ObjectHandle::new("Foo");
        h.assign(&reference("1"));
        h.set_removed(true);
        let err = h.set("x", 1).unwrap_err();
        assert!(matches!(err, CoreError::UseAfterRemove { ref object } if object == "foo/1"));
    }

    #[test]
    fn equality_is_identity() {
        let a = ObjectHandle::new("Foo");
        let b = ObjectHandle::new("Foo");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);

        a.assign(&reference("1"));
        b.assign(&reference("1"));
        assert_eq!(a, b);
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn self_reference_debug_does_not_recurse() {
        let a = ObjectHandle::new("Foo");
        a.set("me", &a).unwrap();
        let text = format!("{a:?}");
        assert!(text.starts_with("ObjectHandle"));
    }

    #[test]
    fn strip_id_makes_transient() {
        let h = ObjectHandle::new("Foo");
        h.assign(&reference("1"));
        h.mark_written(Version::counter(1), Document::new());
        h.strip_id();
        assert!(!h.is_persistent());
        assert!(h.version().is_none());
        assert!(h.stored_document().is_none());
    }

    #[test]
    fn snapshot_restores_state() {
        let h = ObjectHandle::new("Foo").with("n", 1);
        let snap = h.snapshot();
        h.set("n", 2).unwrap();
        h.restore(snap);
        assert_eq!(h.get("n").unwrap(), Some(Value::Int(1)));
        assert!(!h.is_dirty());
    }
}
