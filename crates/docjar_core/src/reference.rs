//! Reference resolution between handles and placeholders.

use crate::cache::IdentityCache;
use crate::codec::{ReferenceReader, ReferenceWriter, TypeRegistry};
use crate::error::{CoreError, CoreResult};
use crate::object::ObjectHandle;
use crate::types::ObjectRef;
use docjar_storage::ObjectId;
use tracing::trace;

/// Maps object handles to `(table, id)` placeholders and back, through the
/// identity cache.
///
/// Writing a reference to a new object either assigns it an id (cascading
/// registration) or fails with [`CoreError::UnassignedReference`]. Newly
/// assigned objects are collected so the caller can schedule their insert.
///
/// Reading a placeholder returns the cached handle for it, or caches and
/// returns a hollow one. No placeholder is ever expanded inline, so cyclic
/// graphs decode without recursion.
pub struct ReferenceResolver<'a> {
    registry: &'a TypeRegistry,
    cache: &'a mut IdentityCache,
    cascade: bool,
    discovered: Vec<ObjectHandle>,
}

impl<'a> ReferenceResolver<'a> {
    /// Creates a resolver.
    pub fn new(registry: &'a TypeRegistry, cache: &'a mut IdentityCache, cascade: bool) -> Self {
        Self {
            registry,
            cache,
            cascade,
            discovered: Vec::new(),
        }
    }

    /// Returns the new objects that were assigned ids, in discovery order.
    pub fn take_discovered(&mut self) -> Vec<ObjectHandle> {
        std::mem::take(&mut self.discovered)
    }
}

impl ReferenceWriter for ReferenceResolver<'_> {
    fn write_ref(&mut self, target: &ObjectHandle) -> CoreResult<ObjectRef> {
        // Removed targets keep their id and are still referenced by it.
        if let Some(placeholder) = target.object_ref() {
            return Ok(placeholder);
        }

        let class = target.class();
        if !self.cascade {
            return Err(CoreError::UnassignedReference { class });
        }

        let table = self.registry.table_of(&class).ok_or_else(|| {
            CoreError::invalid_operation(format!("class {class} is not registered"))
        })?;
        let placeholder = ObjectRef::new(table, ObjectId::generate());
        target.assign(&placeholder);
        self.cache.put(placeholder.clone(), target.clone());
        self.discovered.push(target.clone());

        trace!(object = %placeholder, class = %class, "assigned id to referenced object");
        Ok(placeholder)
    }
}

impl ReferenceReader for ReferenceResolver<'_> {
    fn read_ref(&mut self, placeholder: &ObjectRef) -> CoreResult<ObjectHandle> {
        if let Some(handle) = self.cache.get(placeholder) {
            return Ok(handle);
        }

        let class = self.registry.base_class(&placeholder.table).ok_or_else(|| {
            CoreError::schema_mismatch(format!(
                "reference to table {} which stores no registered class",
                placeholder.table
            ))
        })?;
        let handle = ObjectHandle::hollow(class, placeholder);
        Ok(self.cache.put(placeholder.clone(), handle))
    }
}
