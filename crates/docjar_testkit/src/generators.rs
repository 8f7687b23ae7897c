//! Property-based test generators using proptest.
//!
//! Values generated here stay inside the shapes the codec round-trips
//! exactly: floats are never NaN, datetimes fall within years 1970..=9999
//! and records are always complete [`POINT`](crate::POINT)s.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use docjar_core::{Attributes, Decimal, ObjectId, Record, Value};
use proptest::prelude::*;

/// Strategy for attribute names: lowercase, never starting with `_`.
pub fn attribute_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for map keys, including the `_type` key that forces map
/// wrapping.
pub fn map_key_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        4 => prop::string::string_regex("[a-zA-Z_][a-zA-Z0-9_]{0,7}").expect("Invalid regex"),
        1 => Just("_type".to_string()),
    ]
}

/// Strategy for explicit object ids.
pub fn object_id_strategy() -> impl Strategy<Value = ObjectId> {
    prop::string::string_regex("[a-z0-9-]{1,24}")
        .expect("Invalid regex")
        .prop_map(ObjectId::new)
}

/// Strategy for decimal literals.
pub fn decimal_strategy() -> impl Strategy<Value = Decimal> {
    prop::string::string_regex("-?[0-9]{1,12}(\\.[0-9]{1,6})?")
        .expect("Invalid regex")
        .prop_filter_map("decimal literal", |s| Decimal::parse(&s).ok())
}

/// Strategy for floats, including infinities.
pub fn float_strategy() -> impl Strategy<Value = f64> {
    prop_oneof![
        8 => any::<f64>().prop_filter("finite", |f| f.is_finite()),
        1 => Just(f64::INFINITY),
        1 => Just(f64::NEG_INFINITY),
    ]
}

/// Strategy for leaf values.
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        float_strategy().prop_map(Value::Float),
        ".{0,24}".prop_map(Value::Text),
        decimal_strategy().prop_map(Value::Decimal),
        (0i64..253_402_300_799, 0u32..1_000_000_000)
            .prop_filter_map("datetime", |(secs, nanos)| {
                DateTime::<Utc>::from_timestamp(secs, nanos)
            })
            .prop_map(Value::DateTime),
        (1i32..3_652_059)
            .prop_filter_map("date", NaiveDate::from_num_days_from_ce_opt)
            .prop_map(Value::Date),
        (0u32..86_400, 0u32..1_000_000_000)
            .prop_filter_map("time", |(secs, nanos)| {
                NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
            })
            .prop_map(Value::Time),
    ]
}

/// Strategy for [`POINT`](crate::POINT) records.
pub fn point_strategy() -> impl Strategy<Value = Record> {
    (any::<i64>(), any::<i64>())
        .prop_map(|(x, y)| Record::new(crate::POINT).with("x", x).with("y", y))
}

/// Strategy for nested values without references.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        8 => scalar_value_strategy(),
        1 => point_strategy().prop_map(Value::Record),
    ];
    leaf.prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
            prop::collection::btree_map(map_key_strategy(), inner, 0..6).prop_map(Value::Map),
        ]
    })
}

/// Strategy for an object's attributes.
pub fn attributes_strategy() -> impl Strategy<Value = Attributes> {
    prop::collection::btree_map(attribute_name_strategy(), value_strategy(), 0..8)
}

/// A step applied to a tracked set of objects.
#[derive(Debug, Clone)]
pub enum ObjectOperation {
    /// Insert a new object.
    Insert {
        /// Object id.
        id: ObjectId,
        /// Initial attributes.
        attributes: Attributes,
    },
    /// Set one attribute of an object.
    Set {
        /// Object id.
        id: ObjectId,
        /// Attribute name.
        name: String,
        /// New value.
        value: Value,
    },
    /// Remove an object.
    Remove {
        /// Object id.
        id: ObjectId,
    },
}

impl ObjectOperation {
    /// Returns the id the operation targets.
    pub fn id(&self) -> &ObjectId {
        match self {
            Self::Insert { id, .. } | Self::Set { id, .. } | Self::Remove { id } => id,
        }
    }
}

/// Strategy for object operations over a small id space, so that
/// operations hit the same objects repeatedly.
pub fn object_operation_strategy() -> impl Strategy<Value = ObjectOperation> {
    let id = (0u8..8).prop_map(|n| ObjectId::new(format!("obj-{n}")));
    prop_oneof![
        3 => (id.clone(), attributes_strategy())
            .prop_map(|(id, attributes)| ObjectOperation::Insert { id, attributes }),
        3 => (id.clone(), attribute_name_strategy(), scalar_value_strategy())
            .prop_map(|(id, name, value)| ObjectOperation::Set { id, name, value }),
        1 => id.prop_map(|id| ObjectOperation::Remove { id }),
    ]
}

/// Strategy for a sequence of operations.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<ObjectOperation>> {
    prop::collection::vec(object_operation_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
