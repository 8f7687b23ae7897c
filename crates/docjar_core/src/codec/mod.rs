//! Document codec.
//!
//! Converts one object's attributes into a JSON document and back. The
//! codec knows value shapes and the type registry; object identity is the
//! business of whoever implements [`ReferenceWriter`] and
//! [`ReferenceReader`].
//!
//! ## Document layout
//!
//! ```json
//! {
//!   "_class": "Person",
//!   "name": "Ada",
//!   "born": {"_type": "date", "value": "1815-12-10"},
//!   "friend": {"_type": "ref", "table": "person", "id": "4f1c..."},
//!   "home": {"_type": "Address", "city": "London"}
//! }
//! ```
//!
//! Primitives map to native JSON. Every other value is an object tagged
//! with `_type`: one of the built-in tags below, a registered record name,
//! or the tag of a registered [`ValueSerializer`]. Serializers are asked
//! first, so they can also replace a built-in representation. A plain map
//! that happens to contain a `_type` key is wrapped as
//! `{"_type": "map", "value": {..}}`.

mod decoder;
mod encoder;
mod registry;
mod serializer;

pub use registry::{ClassInfo, FieldKind, RecordInfo, TypeRegistry};
pub use serializer::{ObjectHooks, ValueSerializer};

use crate::error::CoreResult;
use crate::object::{Attributes, ObjectHandle, Value};
use crate::types::ObjectRef;
use decoder::Decoder;
use docjar_storage::Document;
use encoder::Encoder;

/// Document key holding the concrete class name.
pub const CLASS_KEY: &str = "_class";

/// Key holding the tag of a non-primitive value.
pub const TYPE_KEY: &str = "_type";

pub(crate) const TAG_REF: &str = "ref";
pub(crate) const TAG_DATETIME: &str = "datetime";
pub(crate) const TAG_DATE: &str = "date";
pub(crate) const TAG_TIME: &str = "time";
pub(crate) const TAG_DECIMAL: &str = "decimal";
pub(crate) const TAG_FLOAT: &str = "float";
pub(crate) const TAG_MAP: &str = "map";

/// Value tags that cannot be used as record names.
pub const RESERVED_TAGS: [&str; 7] = [
    TAG_REF,
    TAG_DATETIME,
    TAG_DATE,
    TAG_TIME,
    TAG_DECIMAL,
    TAG_FLOAT,
    TAG_MAP,
];

/// Turns object references into placeholders while encoding.
pub trait ReferenceWriter {
    /// Returns the placeholder for `target`.
    ///
    /// # Errors
    ///
    /// Fails if the target has no id and none can be assigned.
    fn write_ref(&mut self, target: &ObjectHandle) -> CoreResult<ObjectRef>;
}

/// Turns placeholders into object handles while decoding.
pub trait ReferenceReader {
    /// Returns the handle for `placeholder`.
    ///
    /// # Errors
    ///
    /// Fails if no class is stored in the placeholder's table.
    fn read_ref(&mut self, placeholder: &ObjectRef) -> CoreResult<ObjectHandle>;
}

/// A decoded document.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Concrete class recorded in the document.
    pub class: String,
    /// Attribute values.
    pub attributes: Attributes,
}

/// Encoder and decoder for object documents.
#[derive(Debug, Clone, Copy)]
pub struct Codec<'r> {
    registry: &'r TypeRegistry,
}

impl<'r> Codec<'r> {
    /// Creates a codec over a registry.
    #[must_use]
    pub fn new(registry: &'r TypeRegistry) -> Self {
        Self { registry }
    }

    /// Encodes a loaded object into a document.
    ///
    /// # Errors
    ///
    /// Fails if the handle is hollow, its class is not registered, an
    /// attribute does not fit its declared kind, or a reference cannot be
    /// written.
    pub fn encode(
        &self,
        handle: &ObjectHandle,
        refs: &mut dyn ReferenceWriter,
    ) -> CoreResult<Document> {
        Encoder::new(self.registry, refs).encode_object(&handle.class(), &handle.attributes()?)
    }

    /// Decodes a document as an instance of `target_class` or a subclass.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaMismatch`](crate::CoreError::SchemaMismatch)
    /// if the class tag is missing, unknown or unrelated to the target, or
    /// a value does not fit its declared shape.
    pub fn decode(
        &self,
        document: &Document,
        target_class: &str,
        refs: &mut dyn ReferenceReader,
    ) -> CoreResult<Decoded> {
        Decoder::new(self.registry, refs).decode_object(document, target_class)
    }

    /// Encodes a single value.
    ///
    /// # Errors
    ///
    /// Fails like [`Codec::encode`].
    pub fn encode_value(
        &self,
        value: &Value,
        refs: &mut dyn ReferenceWriter,
    ) -> CoreResult<serde_json::Value> {
        Encoder::new(self.registry, refs).encode_value(value)
    }

    /// Decodes a single value.
    ///
    /// # Errors
    ///
    /// Fails like [`Codec::decode`].
    pub fn decode_value(
        &self,
        json: &serde_json::Value,
        refs: &mut dyn ReferenceReader,
    ) -> CoreResult<Value> {
        Decoder::new(self.registry, refs).decode_value(json)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Reference stand-ins for codec tests.

    use super::*;
    use std::collections::HashMap;

    /// Writes refs for persistent handles only.
    pub struct PlainRefs;

    impl ReferenceWriter for PlainRefs {
        fn write_ref(&mut self, target: &ObjectHandle) -> CoreResult<ObjectRef> {
            target
                .object_ref()
                .ok_or_else(|| crate::CoreError::UnassignedReference {
                    class: target.class(),
                })
        }
    }

    /// Hands out one hollow handle per placeholder.
    #[derive(Default)]
    pub struct HollowRefs {
        pub seen: HashMap<ObjectRef, ObjectHandle>,
    }

    impl ReferenceReader for HollowRefs {
        fn read_ref(&mut self, placeholder: &ObjectRef) -> CoreResult<ObjectHandle> {
            Ok(self
                .seen
                .entry(placeholder.clone())
                .or_insert_with(|| ObjectHandle::hollow("Foo", placeholder))
                .clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{HollowRefs, PlainRefs};
    use super::*;
    use crate::object::{Decimal, Record};
    use crate::CoreError;
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn registry() -> TypeRegistry {
        let mut r = TypeRegistry::new();
        r.register_class(ClassInfo::new("Foo", "foo")).unwrap();
        r.register_class(
            ClassInfo::new("Sub", "foo")
                .extends("Foo")
                .field("n", FieldKind::Int),
        )
        .unwrap();
        r.register_class(ClassInfo::new("Bar", "bar")).unwrap();
        r.register_record(
            RecordInfo::new("Point")
                .field("x", FieldKind::Int)
                .field("y", FieldKind::Int),
        )
        .unwrap();
        r
    }

    fn round_trip(value: Value) -> Value {
        let r = registry();
        let codec = Codec::new(&r);
        let json = codec.encode_value(&value, &mut PlainRefs).unwrap();
        codec.decode_value(&json, &mut HollowRefs::default()).unwrap()
    }

    #[test]
    fn document_carries_class_tag() {
        let r = registry();
        let h = ObjectHandle::new("Foo").with("name", "foo").with("n", 3);
        let doc = Codec::new(&r).encode(&h, &mut PlainRefs).unwrap();
        assert_eq!(
            serde_json::Value::Object(doc),
            json!({"_class": "Foo", "name": "foo", "n": 3})
        );
    }

    #[test]
    fn tagged_values() {
        let r = registry();
        let codec = Codec::new(&r);
        let when = Utc.with_ymd_and_hms(2024, 2, 29, 12, 30, 0).unwrap();
        let json = codec
            .encode_value(&Value::DateTime(when), &mut PlainRefs)
            .unwrap();
        assert_eq!(
            json,
            json!({"_type": "datetime", "value": "2024-02-29T12:30:00.000000000Z"})
        );

        let json = codec
            .encode_value(&Value::Float(f64::INFINITY), &mut PlainRefs)
            .unwrap();
        assert_eq!(json, json!({"_type": "float", "value": "inf"}));

        let point = Record::new("Point").with("x", 1).with("y", 2);
        let json = codec
            .encode_value(&Value::Record(point), &mut PlainRefs)
            .unwrap();
        assert_eq!(json, json!({"_type": "Point", "x": 1, "y": 2}));
    }

    #[test]
    fn references_become_placeholders() {
        let r = registry();
        let codec = Codec::new(&r);
        let target = ObjectHandle::new("Bar");
        target.assign(&ObjectRef::new("bar", "7"));

        let json = codec
            .encode_value(&Value::from(&target), &mut PlainRefs)
            .unwrap();
        assert_eq!(json, json!({"_type": "ref", "table": "bar", "id": "7"}));

        let mut reader = HollowRefs::default();
        let value = codec.decode_value(&json, &mut reader).unwrap();
        let handle = value.as_handle().unwrap();
        assert!(handle.is_hollow());
        assert_eq!(handle.object_ref(), Some(ObjectRef::new("bar", "7")));
    }

    #[test]
    fn new_reference_without_writer_support_fails() {
        let r = registry();
        let h = ObjectHandle::new("Foo").with("other", ObjectHandle::new("Bar"));
        let err = Codec::new(&r).encode(&h, &mut PlainRefs).unwrap_err();
        assert!(matches!(err, CoreError::UnassignedReference { .. }));
    }

    #[test]
    fn map_with_type_key_is_escaped() {
        let map = BTreeMap::from([
            ("_type".to_string(), Value::from("ref")),
            ("id".to_string(), Value::Int(1)),
        ]);
        let r = registry();
        let json = Codec::new(&r)
            .encode_value(&Value::Map(map.clone()), &mut PlainRefs)
            .unwrap();
        assert_eq!(json["_type"], json!("map"));
        assert_eq!(round_trip(Value::Map(map.clone())), Value::Map(map));
    }

    #[test]
    fn exact_round_trips() {
        let values = [
            Value::Null,
            Value::Int(i64::MIN),
            Value::Int(i64::MAX),
            Value::Float(0.1),
            Value::Float(2.0),
            Value::Float(f64::NEG_INFINITY),
            Value::Decimal(Decimal::parse("10.250").unwrap()),
            Value::DateTime(Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap()),
            Value::Date(NaiveDate::from_ymd_opt(1815, 12, 10).unwrap()),
            Value::Time(NaiveTime::from_hms_nano_opt(23, 59, 59, 1).unwrap()),
            Value::List(vec![Value::Int(1), Value::from("a")]),
            Value::Record(Record::new("Point").with("x", 1).with("y", -1)),
        ];
        for value in values {
            assert_eq!(round_trip(value.clone()), value);
        }
    }

    #[test]
    fn nan_round_trips_as_nan() {
        let value = round_trip(Value::Float(f64::NAN));
        assert!(value.as_float().is_some_and(f64::is_nan));
    }

    #[test]
    fn decode_resolves_subclass() {
        let r = registry();
        let doc = json!({"_class": "Sub", "n": 1}).as_object().cloned().unwrap();
        let decoded = Codec::new(&r)
            .decode(&doc, "Foo", &mut HollowRefs::default())
            .unwrap();
        assert_eq!(decoded.class, "Sub");
        assert_eq!(decoded.attributes["n"], Value::Int(1));
    }

    #[test]
    fn decode_rejects_mismatches() {
        let r = registry();
        let codec = Codec::new(&r);
        let cases = [
            json!({"name": "no tag"}),
            json!({"_class": "Nope"}),
            json!({"_class": "Bar"}),
            json!({"_class": "Sub", "n": "not an int"}),
            json!({"_class": "Foo", "x": {"_type": "unknown"}}),
            json!({"_class": "Foo", "x": {"_type": "Point", "x": 1}}),
            json!({"_class": "Foo", "x": 18_446_744_073_709_551_615_u64}),
            json!({"_class": "Foo", "x": {"_type": "date", "value": "yesterday"}}),
        ];
        for case in cases {
            let doc = case.as_object().cloned().unwrap();
            let err = codec
                .decode(&doc, "Foo", &mut HollowRefs::default())
                .unwrap_err();
            assert!(
                matches!(err, CoreError::SchemaMismatch { .. }),
                "{case}: {err}"
            );
        }
    }

    #[test]
    fn encode_rejects_reserved_attribute() {
        let r = registry();
        let h = ObjectHandle::new("Foo").with(CLASS_KEY, "Bar");
        assert!(Codec::new(&r).encode(&h, &mut PlainRefs).is_err());
    }

    /// Stores `Money` records as amount and currency text.
    #[derive(Debug)]
    struct MoneySerializer;

    impl ValueSerializer for MoneySerializer {
        fn tag(&self) -> &str {
            "money"
        }

        fn can_write(&self, value: &Value) -> bool {
            value.as_record().is_some_and(|r| r.name() == "Money")
        }

        fn can_read(&self, state: &serde_json::Map<String, serde_json::Value>) -> bool {
            state.contains_key("amount")
        }

        fn write(&self, value: &Value) -> CoreResult<serde_json::Map<String, serde_json::Value>> {
            let record = value.as_record().unwrap();
            let amount = match record.get("amount") {
                Some(Value::Decimal(d)) => d.as_str().to_string(),
                other => return Err(CoreError::schema_mismatch(format!("amount {other:?}"))),
            };
            let currency = record.get("currency").and_then(Value::as_str).unwrap_or("EUR");
            Ok(json!({"amount": amount, "currency": currency})
                .as_object()
                .cloned()
                .unwrap())
        }

        fn read(&self, state: &serde_json::Map<String, serde_json::Value>) -> CoreResult<Value> {
            let amount = Decimal::parse(state["amount"].as_str().unwrap_or_default())?;
            let currency = state
                .get("currency")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("EUR");
            Ok(Value::Record(
                Record::new("Money")
                    .with("amount", Value::Decimal(amount))
                    .with("currency", currency),
            ))
        }
    }

    fn money(amount: &str) -> Value {
        Value::Record(
            Record::new("Money")
                .with("amount", Value::Decimal(Decimal::parse(amount).unwrap()))
                .with("currency", "EUR"),
        )
    }

    #[test]
    fn serializer_owns_its_tag() {
        let mut r = registry();
        r.register_serializer(std::sync::Arc::new(MoneySerializer)).unwrap();
        let codec = Codec::new(&r);

        let json = codec.encode_value(&money("10.25"), &mut PlainRefs).unwrap();
        assert_eq!(
            json,
            json!({"_type": "money", "amount": "10.25", "currency": "EUR"})
        );
        let back = codec
            .decode_value(&json, &mut HollowRefs::default())
            .unwrap();
        assert_eq!(back, money("10.25"));

        let nested = Value::List(vec![money("1"), Value::Int(2)]);
        let json = codec.encode_value(&nested, &mut PlainRefs).unwrap();
        assert_eq!(json[0]["_type"], json!("money"));
        assert_eq!(
            codec.decode_value(&json, &mut HollowRefs::default()).unwrap(),
            nested
        );
    }

    #[test]
    fn serializer_refusals_are_errors() {
        let mut r = registry();
        r.register_serializer(std::sync::Arc::new(MoneySerializer)).unwrap();
        let codec = Codec::new(&r);

        let bad = Value::Record(Record::new("Money").with("amount", 3));
        let err = codec.encode_value(&bad, &mut PlainRefs).unwrap_err();
        assert!(matches!(err, CoreError::SchemaMismatch { .. }));

        let err = codec
            .decode_value(&json!({"_type": "money", "cents": 3}), &mut HollowRefs::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::SchemaMismatch { .. }));
    }

    #[test]
    fn serializer_tags_cannot_collide() {
        let mut r = registry();
        r.register_serializer(std::sync::Arc::new(MoneySerializer)).unwrap();
        assert!(r.register_serializer(std::sync::Arc::new(MoneySerializer)).is_err());
        assert!(r.register_record(RecordInfo::new("money")).is_err());
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            any::<f64>()
                .prop_filter("nan never equals itself", |f| !f.is_nan())
                .prop_map(Value::Float),
            ".*".prop_map(Value::Text),
            (0i64..253_402_300_799, 0u32..1_000_000_000)
                .prop_map(|(s, n)| Value::DateTime(Utc.timestamp_opt(s, n).unwrap())),
        ]
    }

    fn tree() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                prop::collection::btree_map("[_a-z]{0,6}", inner, 0..6).prop_map(Value::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn values_round_trip(value in tree()) {
            prop_assert_eq!(round_trip(value.clone()), value);
        }
    }
}
