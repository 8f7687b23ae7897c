//! Golden documents for format verification.
//!
//! Each case commits objects through a data manager and compares the stored
//! document with the expected JSON, so any change to the document layout
//! shows up as a diff here.

use crate::fixtures::{TestStore, BAR, FOO, POINT, SUB};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use docjar_core::{
    CoreResult, DataManager, Decimal, ObjectHandle, ObjectId, ObjectRef, Record, Value,
};
use serde_json::json;
use std::collections::BTreeMap;

/// A named object layout and the document it must be stored as.
pub struct GoldenCase {
    /// Case name, used in failure messages.
    pub name: &'static str,
    /// Inserts the objects and returns the reference to check.
    pub build: fn(&mut DataManager) -> CoreResult<ObjectRef>,
    /// The expected stored document.
    pub expected: serde_json::Value,
}

impl GoldenCase {
    /// Commits the case into `store` and asserts the stored document.
    pub fn assert_in(&self, store: &TestStore) {
        let reference = store
            .commit_with(self.build)
            .unwrap_or_else(|e| panic!("Golden case '{}' failed to commit: {e}", self.name));
        let actual = store
            .document(&reference)
            .map(serde_json::Value::Object)
            .unwrap_or_else(|| panic!("Golden case '{}' stored nothing", self.name));

        assert_eq!(
            actual,
            self.expected,
            "Golden case '{}' failed:\nExpected: {}\nActual: {}",
            self.name,
            self.expected,
            actual
        );
    }
}

fn insert(dm: &mut DataManager, object: &ObjectHandle, id: &str) -> CoreResult<ObjectRef> {
    dm.insert(object, Some(ObjectId::new(id)))
}

/// Returns every golden case.
pub fn golden_cases() -> Vec<GoldenCase> {
    vec![
        GoldenCase {
            name: "scalars",
            build: |dm| {
                let object = ObjectHandle::new(FOO)
                    .with("flag", true)
                    .with("count", 3)
                    .with("ratio", 0.5)
                    .with("name", "foo")
                    .with("missing", Value::Null);
                insert(dm, &object, "scalars")
            },
            expected: json!({
                "_class": "Foo",
                "flag": true,
                "count": 3,
                "ratio": 0.5,
                "name": "foo",
                "missing": null,
            }),
        },
        GoldenCase {
            name: "temporal_and_decimal",
            build: |dm| {
                let at = Utc
                    .with_ymd_and_hms(2024, 1, 2, 3, 4, 5)
                    .single()
                    .expect("valid datetime");
                let object = ObjectHandle::new(FOO)
                    .with("at", at)
                    .with("day", NaiveDate::from_ymd_opt(2024, 1, 2).expect("valid date"))
                    .with("time", NaiveTime::from_hms_opt(3, 4, 5).expect("valid time"))
                    .with("price", Decimal::parse("12.50")?)
                    .with("big", f64::INFINITY);
                insert(dm, &object, "temporal")
            },
            expected: json!({
                "_class": "Foo",
                "at": {"_type": "datetime", "value": "2024-01-02T03:04:05.000000000Z"},
                "day": {"_type": "date", "value": "2024-01-02"},
                "time": {"_type": "time", "value": "03:04:05"},
                "price": {"_type": "decimal", "value": "12.50"},
                "big": {"_type": "float", "value": "inf"},
            }),
        },
        GoldenCase {
            name: "reference",
            build: |dm| {
                let bar = ObjectHandle::new(BAR).with("n", 7);
                insert(dm, &bar, "b1")?;
                let foo = ObjectHandle::new(FOO).with("bar", &bar);
                insert(dm, &foo, "r1")
            },
            expected: json!({
                "_class": "Foo",
                "bar": {"_type": "ref", "table": "bar", "id": "b1"},
            }),
        },
        GoldenCase {
            name: "subclass",
            build: |dm| {
                let sub = ObjectHandle::new(SUB).with("extra", "more");
                insert(dm, &sub, "sub")
            },
            expected: json!({
                "_class": "Sub",
                "extra": "more",
            }),
        },
        GoldenCase {
            name: "record_and_tagged_map",
            build: |dm| {
                let mut map = BTreeMap::new();
                map.insert("_type".to_string(), Value::from("user data"));
                map.insert("k".to_string(), Value::Int(1));
                let object = ObjectHandle::new(FOO)
                    .with("at", Record::new(POINT).with("x", 1).with("y", 2))
                    .with("meta", map)
                    .with("tags", vec![Value::from("a"), Value::from("b")]);
                insert(dm, &object, "record")
            },
            expected: json!({
                "_class": "Foo",
                "at": {"_type": "Point", "x": 1, "y": 2},
                "meta": {"_type": "map", "value": {"_type": "user data", "k": 1}},
                "tags": ["a", "b"],
            }),
        },
    ]
}
