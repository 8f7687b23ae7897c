//! Cross-crate integration test helpers.
//!
//! Provides a harness that mirrors every committed change in memory and
//! checks the store against it, plus reusable transaction scenarios.

use crate::fixtures::{TestStore, FOO, FOO_TABLE};
use crate::generators::ObjectOperation;
use docjar_core::{
    Attributes, CoreError, CoreResult, ObjectHandle, ObjectId, ObjectRef, StorageError, Value,
};
use std::collections::HashMap;

/// A test harness for integration testing.
pub struct IntegrationHarness {
    /// The store under test.
    pub store: TestStore,
    /// Expected attributes of every live object.
    objects: HashMap<ObjectRef, Attributes>,
}

impl IntegrationHarness {
    /// Creates a harness over an empty store.
    pub fn new() -> Self {
        Self {
            store: TestStore::new(),
            objects: HashMap::new(),
        }
    }

    /// Inserts a Foo object and tracks it.
    pub fn insert(&mut self, id: &ObjectId, attributes: Attributes) -> CoreResult<ObjectRef> {
        let object = attributes
            .iter()
            .fold(ObjectHandle::new(FOO), |h, (name, value)| {
                h.with(name.clone(), value.clone())
            });
        let reference = self
            .store
            .commit_with(|dm| dm.insert(&object, Some(id.clone())))?;
        self.objects.insert(reference.clone(), attributes);
        Ok(reference)
    }

    /// Sets one attribute of a tracked object.
    pub fn set(&mut self, reference: &ObjectRef, name: &str, value: Value) -> CoreResult<()> {
        self.store.commit_with(|dm| {
            let handle = dm
                .get(&reference.table, reference.id.clone())?
                .ok_or_else(|| CoreError::ObjectNotFound {
                    object: reference.clone(),
                })?;
            dm.set_attr(&handle, name, value.clone())
        })?;
        if let Some(attributes) = self.objects.get_mut(reference) {
            attributes.insert(name.to_string(), value);
        }
        Ok(())
    }

    /// Removes a tracked object.
    pub fn remove(&mut self, reference: &ObjectRef) -> CoreResult<()> {
        self.store.commit_with(|dm| {
            if let Some(handle) = dm.get(&reference.table, reference.id.clone())? {
                dm.remove(&handle)?;
            }
            Ok(())
        })?;
        self.objects.remove(reference);
        Ok(())
    }

    /// Applies a generated operation.
    ///
    /// Inserting an id that is already live must fail with a unique
    /// violation; setting or removing an unknown id is skipped.
    pub fn apply(&mut self, operation: &ObjectOperation) {
        let reference = ObjectRef::new(FOO_TABLE, operation.id().clone());
        let live = self.objects.contains_key(&reference);
        match operation {
            ObjectOperation::Insert { id, attributes } => {
                let result = self.insert(id, attributes.clone());
                if live {
                    assert!(
                        matches!(
                            result,
                            Err(CoreError::Backend(StorageError::UniqueViolation { .. }))
                        ),
                        "duplicate insert of {reference} should fail, got {result:?}"
                    );
                } else {
                    result.expect("Failed to insert object");
                }
            }
            ObjectOperation::Set { name, value, .. } if live => {
                self.set(&reference, name, value.clone())
                    .expect("Failed to set attribute");
            }
            ObjectOperation::Remove { .. } if live => {
                self.remove(&reference).expect("Failed to remove object");
            }
            ObjectOperation::Set { .. } | ObjectOperation::Remove { .. } => {}
        }
    }

    /// Reads an object in a fresh transaction and checks it against the
    /// tracked attributes.
    pub fn get_and_verify(&self, reference: &ObjectRef) -> Option<Attributes> {
        let mut dm = self.store.dm();
        let actual = dm
            .get(&reference.table, reference.id.clone())
            .expect("Failed to get object")
            .map(|h| h.attributes().expect("Object should be loaded"));

        assert_eq!(
            actual.as_ref(),
            self.objects.get(reference),
            "Object mismatch for {reference}"
        );
        actual
    }

    /// Verifies every tracked object and that no untracked rows exist.
    pub fn verify_all(&self) {
        for reference in self.objects.keys() {
            self.get_and_verify(reference);
        }
        assert_eq!(
            self.store.row_count(FOO_TABLE),
            self.objects.len(),
            "Row count mismatch"
        );
    }

    /// Returns the count of tracked objects.
    pub fn tracked_count(&self) -> usize {
        self.objects.len()
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction scenarios.
pub mod transaction {
    use super::*;

    /// Checks that an aborted transaction leaves the store unchanged, even
    /// after a flush.
    pub fn check_abort_leaves_store_unchanged(store: &TestStore) {
        let reference = store.seed(FOO, "abort", &[("name", Value::from("original"))]);

        let mut dm = store.dm();
        let result: CoreResult<()> = dm.transaction(|dm| {
            let handle = dm.get(FOO_TABLE, "abort")?.expect("seeded object");
            dm.set_attr(&handle, "name", "modified")?;
            dm.flush()?;
            Err(CoreError::invalid_operation("Simulated abort"))
        });
        assert!(result.is_err());

        let document = store.document(&reference).expect("Object should exist");
        assert_eq!(document["name"], "original");
    }

    /// Checks that a transaction keeps seeing its own loaded state while
    /// another one commits, and that the next transaction sees the commit.
    pub fn check_isolation(store: &TestStore) {
        store.seed(FOO, "iso", &[("name", Value::from("v1"))]);

        let mut reader = store.dm();
        let seen = reader.get(FOO_TABLE, "iso").unwrap().expect("seeded object");
        assert_eq!(reader.get_attr(&seen, "name").unwrap(), Some("v1".into()));

        store
            .commit_with(|dm| {
                let handle = dm.get(FOO_TABLE, "iso")?.expect("seeded object");
                dm.set_attr(&handle, "name", "v2")
            })
            .expect("Failed to update");

        let again = reader.get(FOO_TABLE, "iso").unwrap().expect("cached object");
        assert!(again.ptr_eq(&seen));
        assert_eq!(reader.get_attr(&again, "name").unwrap(), Some("v1".into()));

        reader.abort().unwrap();
        reader.reset().unwrap();
        let fresh = reader.get(FOO_TABLE, "iso").unwrap().expect("committed object");
        assert_eq!(reader.get_attr(&fresh, "name").unwrap(), Some("v2".into()));
    }
}
