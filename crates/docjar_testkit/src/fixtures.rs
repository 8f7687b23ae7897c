//! Test fixtures and data manager helpers.
//!
//! Provides a shared in-memory store, a type registry covering the shapes
//! the tests use, and tracing setup.

use docjar_core::{
    ClassInfo, Config, CoreResult, DataManager, Document, FieldKind, InMemoryStore, ObjectHandle,
    ObjectId, ObjectRef, RecordInfo, Row, TypeRegistry, Value, VersionScheme,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Root class stored in [`FOO_TABLE`].
pub const FOO: &str = "Foo";
/// Subclass of [`FOO`] sharing its table.
pub const SUB: &str = "Sub";
/// Class stored in [`BAR_TABLE`], with an optional integer field `n`.
pub const BAR: &str = "Bar";
/// Record with integer fields `x` and `y`.
pub const POINT: &str = "Point";

/// Table of [`FOO`] and [`SUB`].
pub const FOO_TABLE: &str = "foo";
/// Table of [`BAR`].
pub const BAR_TABLE: &str = "bar";

/// Installs a test subscriber that honours `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Builds the registry used throughout the tests.
pub fn test_registry() -> Arc<TypeRegistry> {
    Arc::new(base_registry())
}

/// Builds an unshared copy of the test registry, for tests that register
/// serializers or hooks on top of it.
pub fn base_registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry
        .register_class(ClassInfo::new(FOO, FOO_TABLE))
        .expect("register Foo");
    registry
        .register_class(
            ClassInfo::new(SUB, FOO_TABLE)
                .extends(FOO)
                .field("extra", FieldKind::optional(FieldKind::Text)),
        )
        .expect("register Sub");
    registry
        .register_class(
            ClassInfo::new(BAR, BAR_TABLE).field("n", FieldKind::optional(FieldKind::Int)),
        )
        .expect("register Bar");
    registry
        .register_record(
            RecordInfo::new(POINT)
                .field("x", FieldKind::Int)
                .field("y", FieldKind::Int),
        )
        .expect("register Point");
    registry
}

/// A shared in-memory store with the test registry.
///
/// Every data manager created from it gets its own connection, so several
/// of them behave like independent clients of one database.
pub struct TestStore {
    /// The shared store.
    pub store: Arc<InMemoryStore>,
    /// The type registry.
    pub registry: Arc<TypeRegistry>,
}

impl TestStore {
    /// Creates an empty store with counter versions.
    pub fn new() -> Self {
        Self::with_scheme(VersionScheme::Counter)
    }

    /// Creates an empty store with the given version scheme.
    pub fn with_scheme(scheme: VersionScheme) -> Self {
        init_tracing();
        Self {
            store: Arc::new(InMemoryStore::with_scheme(scheme)),
            registry: test_registry(),
        }
    }

    /// Creates an empty store with counter versions and a custom registry.
    pub fn with_registry(registry: TypeRegistry) -> Self {
        init_tracing();
        Self {
            store: Arc::new(InMemoryStore::new()),
            registry: Arc::new(registry),
        }
    }

    /// Opens a data manager with the default configuration.
    pub fn dm(&self) -> DataManager {
        self.dm_with(Config::default())
    }

    /// Opens a data manager with the given configuration.
    pub fn dm_with(&self, config: Config) -> DataManager {
        DataManager::new(self.store.connect(), Arc::clone(&self.registry), config)
    }

    /// Returns the committed row behind a reference.
    pub fn row(&self, reference: &ObjectRef) -> Option<Row> {
        self.store.row(&reference.table, &reference.id)
    }

    /// Returns the committed document behind a reference.
    pub fn document(&self, reference: &ObjectRef) -> Option<Document> {
        self.row(reference).map(|row| row.document)
    }

    /// Returns the number of committed rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.store.row_count(table)
    }

    /// Commits one object in its own transaction and returns its reference.
    pub fn seed(&self, class: &str, id: &str, attributes: &[(&str, Value)]) -> ObjectRef {
        let mut dm = self.dm();
        let object = attributes
            .iter()
            .fold(ObjectHandle::new(class), |h, (name, value)| {
                h.with(*name, value.clone())
            });
        dm.transaction(|dm| dm.insert(&object, Some(ObjectId::new(id))))
            .expect("seed object")
    }

    /// Runs `f` in a fresh transaction of a new data manager and commits.
    pub fn commit_with<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut DataManager) -> CoreResult<T>,
    {
        self.dm().transaction(f)
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a test against a fresh store.
///
/// # Example
///
/// ```rust,ignore
/// use docjar_testkit::with_store;
///
/// #[test]
/// fn my_test() {
///     with_store(|store| {
///         let mut dm = store.dm();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_store<F, R>(f: F) -> R
where
    F: FnOnce(&TestStore) -> R,
{
    let store = TestStore::new();
    f(&store)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a store holding `count` Foo objects with ids `foo-0`,
    /// `foo-1`, ... and an `index` attribute.
    pub fn populated_store(count: usize) -> TestStore {
        let store = TestStore::new();
        let mut dm = store.dm();
        dm.transaction(|dm| {
            for i in 0..count {
                let index = i64::try_from(i).unwrap_or(i64::MAX);
                let object = ObjectHandle::new(FOO).with("index", index);
                dm.insert(&object, Some(ObjectId::new(format!("foo-{i}"))))?;
            }
            Ok(())
        })
        .expect("populate store");
        store
    }

    /// Creates a Foo `a` and a Bar `b` referencing each other and commits
    /// them. Returns their references.
    pub fn cyclic_pair(store: &TestStore) -> (ObjectRef, ObjectRef) {
        let a = ObjectHandle::new(FOO).with("name", "a");
        let b = ObjectHandle::new(BAR).with("n", 1);
        a.set("peer", &b).expect("link a");
        b.set("peer", &a).expect("link b");
        store
            .commit_with(|dm| {
                let a_ref = dm.insert(&a, Some(ObjectId::new("a")))?;
                let b_ref = dm.insert(&b, Some(ObjectId::new("b")))?;
                Ok((a_ref, b_ref))
            })
            .expect("commit cyclic pair")
    }
}
