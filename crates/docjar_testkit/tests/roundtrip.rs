//! Integration tests for storing and loading object graphs.

use docjar_core::{
    Backend, Config, CoreError, CoreResult, Document, ObjectHandle, ObjectHooks, ObjectId,
    ObjectRef, Record, ResolveMode, TxnStatus, Value, ValueSerializer, VersionScheme, CLASS_KEY,
};
use docjar_testkit::prelude::*;
use proptest::prelude::*;
use serde_json::{json, Map, Value as Json};
use std::sync::{Arc, Mutex};

fn raw_insert(store: &TestStore, table: &str, id: &str, document: serde_json::Value) {
    let serde_json::Value::Object(document) = document else {
        panic!("document must be an object");
    };
    let mut conn = store.store.connect();
    conn.begin().unwrap();
    conn.insert_row(table, &ObjectId::new(id), document).unwrap();
    conn.commit().unwrap();
}

#[test]
fn test_golden_cases() {
    for case in golden_cases() {
        case.assert_in(&TestStore::new());
    }
}

#[test]
fn test_cycle_decodes_to_same_handle() {
    let store = TestStore::new();
    scenarios::cyclic_pair(&store);

    let mut dm = store.dm();
    let a = dm.get(FOO_TABLE, "a").unwrap().unwrap();
    let b = dm.get_attr(&a, "peer").unwrap().unwrap();
    let b = b.as_handle().unwrap().clone();
    assert_eq!(b.class(), BAR);

    let back = dm.get_attr(&b, "peer").unwrap().unwrap();
    assert!(back.as_handle().unwrap().ptr_eq(&a));
}

#[test]
fn test_eager_resolution_rejects_cycles() {
    let store = TestStore::new();
    scenarios::cyclic_pair(&store);

    let mut dm = store.dm_with(Config::new().resolve_mode(ResolveMode::Eager));
    let err = dm.get(FOO_TABLE, "a").unwrap_err();
    let CoreError::CircularReference { cycle } = &err else {
        panic!("expected a circular reference, got {err:?}");
    };
    assert_eq!(cycle, &vec!["foo/a", "bar/b", "foo/a"]);
    assert_eq!(dm.status(), TxnStatus::Aborted);
}

#[test]
fn test_eager_resolution_loads_graph() {
    let store = TestStore::new();
    store
        .commit_with(|dm| {
            let bar = ObjectHandle::new(BAR).with("n", 2);
            let foo = ObjectHandle::new(FOO).with("items", vec![Value::from(&bar)]);
            dm.insert(&foo, Some(ObjectId::new("root")))
        })
        .unwrap();

    let mut dm = store.dm_with(Config::new().resolve_mode(ResolveMode::Eager));
    let root = dm.get(FOO_TABLE, "root").unwrap().unwrap();
    let items = root.get("items").unwrap().unwrap();
    let bar = items.as_list().unwrap()[0].as_handle().unwrap().clone();
    assert!(!bar.is_hollow());
    assert_eq!(bar.get("n").unwrap(), Some(Value::Int(2)));
}

#[test]
fn test_unknown_class_tag_is_schema_mismatch() {
    let store = TestStore::new();
    raw_insert(&store, FOO_TABLE, "bad", json!({"_class": "Nope"}));

    let mut dm = store.dm();
    let err = dm.get(FOO_TABLE, "bad").unwrap_err();
    assert!(matches!(err, CoreError::SchemaMismatch { .. }), "{err:?}");
    assert_eq!(dm.status(), TxnStatus::Aborted);
}

#[test]
fn test_wrong_field_type_is_schema_mismatch() {
    let store = TestStore::new();
    raw_insert(&store, BAR_TABLE, "bad", json!({"_class": "Bar", "n": "seven"}));

    let mut dm = store.dm();
    let err = dm.get(BAR_TABLE, "bad").unwrap_err();
    assert!(matches!(err, CoreError::SchemaMismatch { .. }), "{err:?}");
}

#[test]
fn test_content_hash_versions() {
    let store = TestStore::with_scheme(VersionScheme::ContentHash);
    let reference = store.seed(FOO, "h", &[("name", Value::from("v1"))]);
    let first = store.row(&reference).unwrap().version;
    assert_eq!(first.as_counter(), None);

    store
        .commit_with(|dm| {
            let handle = dm.get(FOO_TABLE, "h")?.expect("seeded object");
            dm.set_attr(&handle, "name", "v2")
        })
        .unwrap();
    assert_ne!(store.row(&reference).unwrap().version, first);
}

#[test]
fn test_unregistered_class_cannot_be_inserted() {
    let store = TestStore::new();
    let mut dm = store.dm();
    let err = dm
        .insert(&ObjectHandle::new("Unknown"), None)
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));
    assert_eq!(dm.status(), TxnStatus::Active);
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn attributes_survive_commit(attributes in attributes_strategy()) {
        let store = TestStore::new();
        let object = attributes
            .iter()
            .fold(ObjectHandle::new(FOO), |h, (name, value)| h.with(name.clone(), value.clone()));
        let reference = store
            .commit_with(|dm| dm.insert(&object, None))
            .unwrap();

        let mut dm = store.dm();
        let loaded = dm.get(&reference.table, reference.id.clone()).unwrap().unwrap();
        prop_assert_eq!(loaded.attributes().unwrap(), attributes);
    }

    #[test]
    fn references_survive_commit(n in any::<i64>(), count in 1usize..5) {
        let store = TestStore::new();
        let bars: Vec<ObjectHandle> = (0..count)
            .map(|i| ObjectHandle::new(BAR).with("n", n).with("i", i64::try_from(i).unwrap()))
            .collect();
        let list: Vec<Value> = bars.iter().map(Value::from).collect();
        let root = ObjectHandle::new(FOO).with("bars", list);
        let reference = store
            .commit_with(|dm| dm.insert(&root, None))
            .unwrap();
        prop_assert_eq!(store.row_count(BAR_TABLE), count);

        let mut dm = store.dm();
        let loaded = dm.get(&reference.table, reference.id.clone()).unwrap().unwrap();
        let items = loaded.get("bars").unwrap().unwrap();
        let items = items.as_list().unwrap();
        prop_assert_eq!(items.len(), count);
        for (i, item) in items.iter().enumerate() {
            let bar = item.as_handle().unwrap();
            prop_assert_eq!(
                bar.object_ref(),
                bars[i].object_ref()
            );
            prop_assert_eq!(dm.get_attr(bar, "n").unwrap(), Some(Value::Int(n)));
        }
    }
}

#[test]
fn test_stored_document_layout() {
    let store = TestStore::new();
    let reference = store
        .commit_with(|dm| {
            let point = docjar_core::Record::new(POINT).with("x", 1).with("y", 2);
            dm.insert(&ObjectHandle::new(FOO).with("at", point), Some(ObjectId::new("p")))
        })
        .unwrap();
    let document: Document = store.document(&reference).unwrap();
    assert_eq!(document["at"], json!({"_type": "Point", "x": 1, "y": 2}));
    assert_eq!(reference, ObjectRef::new(FOO_TABLE, "p"));
}

/// Stores `Point` records as `"x,y"` text.
#[derive(Debug)]
struct CompactPoint;

impl ValueSerializer for CompactPoint {
    fn tag(&self) -> &str {
        "xy"
    }

    fn can_write(&self, value: &Value) -> bool {
        value.as_record().is_some_and(|r| r.name() == POINT)
    }

    fn write(&self, value: &Value) -> CoreResult<Map<String, Json>> {
        let record = value.as_record().unwrap();
        let x = record.get("x").and_then(Value::as_int).unwrap();
        let y = record.get("y").and_then(Value::as_int).unwrap();
        Ok(json!({"v": format!("{x},{y}")}).as_object().cloned().unwrap())
    }

    fn read(&self, state: &Map<String, Json>) -> CoreResult<Value> {
        let (x, y) = state["v"].as_str().unwrap().split_once(',').unwrap();
        Ok(Value::Record(
            Record::new(POINT)
                .with("x", x.parse::<i64>().unwrap())
                .with("y", y.parse::<i64>().unwrap()),
        ))
    }
}

#[test]
fn test_value_serializer_controls_stored_form() {
    let mut registry = base_registry();
    registry.register_serializer(Arc::new(CompactPoint)).unwrap();
    let store = TestStore::with_registry(registry);

    let point = Record::new(POINT).with("x", 3).with("y", -4);
    let reference = store
        .commit_with(|dm| {
            let object = ObjectHandle::new(FOO).with("at", point.clone());
            dm.insert(&object, Some(ObjectId::new("p")))
        })
        .unwrap();
    assert_eq!(
        store.document(&reference).unwrap()["at"],
        json!({"_type": "xy", "v": "3,-4"})
    );

    let mut dm = store.dm();
    let loaded = dm.get(FOO_TABLE, "p").unwrap().unwrap();
    assert_eq!(loaded.get("at").unwrap(), Some(Value::Record(point)));
}

#[derive(Debug, Default)]
struct Recorder {
    stored: Mutex<Vec<ObjectRef>>,
    loaded: Mutex<Vec<ObjectRef>>,
}

impl ObjectHooks for Recorder {
    fn after_store(&self, handle: &ObjectHandle, document: &Document) {
        assert_eq!(document[CLASS_KEY], json!(handle.class()));
        assert!(!handle.is_dirty());
        self.stored.lock().unwrap().push(handle.object_ref().unwrap());
    }

    fn after_load(&self, handle: &ObjectHandle) {
        assert!(!handle.is_hollow());
        self.loaded.lock().unwrap().push(handle.object_ref().unwrap());
    }
}

#[test]
fn test_lifecycle_hooks_run_after_store_and_load() {
    let recorder = Arc::new(Recorder::default());
    let mut registry = base_registry();
    registry.register_hooks(FOO, recorder.clone()).unwrap();
    let store = TestStore::with_registry(registry);
    let sub = ObjectRef::new(FOO_TABLE, "s");

    store
        .commit_with(|dm| {
            dm.insert(&ObjectHandle::new(SUB).with("extra", "x"), Some(ObjectId::new("s")))?;
            dm.insert(&ObjectHandle::new(BAR).with("n", 1), None)
        })
        .unwrap();
    assert_eq!(*recorder.stored.lock().unwrap(), vec![sub.clone()]);
    assert!(recorder.loaded.lock().unwrap().is_empty());

    let mut dm = store.dm();
    let handle = dm.get(FOO_TABLE, "s").unwrap().unwrap();
    dm.get(FOO_TABLE, "s").unwrap().unwrap();
    assert_eq!(*recorder.loaded.lock().unwrap(), vec![sub.clone()]);

    // An unchanged object is not written, so its hook does not run.
    dm.register(&handle).unwrap();
    dm.flush().unwrap();
    assert_eq!(recorder.stored.lock().unwrap().len(), 1);

    dm.set_attr(&handle, "extra", "y").unwrap();
    dm.commit().unwrap();
    assert_eq!(*recorder.stored.lock().unwrap(), vec![sub.clone(), sub]);
}
