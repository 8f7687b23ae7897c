//! Attribute values.

use crate::error::{CoreError, CoreResult};
use crate::object::ObjectHandle;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute map of one object.
pub type Attributes = BTreeMap<String, Value>;

/// Exact decimal number kept as its textual form.
///
/// No arithmetic is offered; the digits are stored and compared exactly as
/// written, so `1.10` and `1.1` are different values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Decimal(String);

impl Decimal {
    /// Parses a decimal literal such as `-12.500` or `3e-2`.
    ///
    /// # Errors
    ///
    /// Returns a schema mismatch if the text is not a decimal literal.
    pub fn parse(text: &str) -> CoreResult<Self> {
        if is_decimal_literal(text) {
            Ok(Self(text.to_string()))
        } else {
            Err(CoreError::schema_mismatch(format!(
                "{text:?} is not a decimal literal"
            )))
        }
    }

    /// Returns the literal.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_decimal_literal(text: &str) -> bool {
    let unsigned = text.strip_prefix(['-', '+']).unwrap_or(text);
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(pos) => (&unsigned[..pos], Some(&unsigned[pos + 1..])),
        None => (unsigned, None),
    };
    let (whole, fraction) = match mantissa.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (mantissa, None),
    };
    let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());

    let mantissa_ok = match fraction {
        Some(f) => digits(whole) && digits(f) && !(whole.is_empty() && f.is_empty()),
        None => !whole.is_empty() && digits(whole),
    };
    let exponent_ok = exponent.map_or(true, |e| {
        let e = e.strip_prefix(['-', '+']).unwrap_or(e);
        !e.is_empty() && digits(e)
    });
    mantissa_ok && exponent_ok
}

/// A fixed-shape value type stored inline in its owner's document.
///
/// The name must be registered with the type registry, and the field set
/// must match the registration exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    name: String,
    fields: BTreeMap<String, Value>,
}

impl Record {
    /// Creates an empty record of the given registered type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Creates a record from its fields.
    pub fn from_fields(name: impl Into<String>, fields: BTreeMap<String, Value>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Adds a field.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Returns the record type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns all fields.
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }
}

/// An attribute value.
///
/// Entity edges are [`Value::Ref`]; everything else is inlined into the
/// owner's document.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float, including non-finite values.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Exact decimal.
    Decimal(Decimal),
    /// Instant in UTC, nanosecond precision.
    DateTime(DateTime<Utc>),
    /// Calendar date.
    Date(NaiveDate),
    /// Wall-clock time.
    Time(NaiveTime),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed map.
    Map(BTreeMap<String, Value>),
    /// Inline record.
    Record(Record),
    /// Reference to another persistent object.
    Ref(ObjectHandle),
}

impl Value {
    /// Returns true for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the boolean, if this is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer, if this is one.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the float, if this is one.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the text, if this is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the list, if this is one.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the map, if this is one.
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Returns the record, if this is one.
    #[must_use]
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Returns the referenced handle, if this is a reference.
    #[must_use]
    pub fn as_handle(&self) -> Option<&ObjectHandle> {
        match self {
            Self::Ref(handle) => Some(handle),
            _ => None,
        }
    }

    /// Appends every handle referenced from this value, depth first.
    pub fn collect_refs(&self, out: &mut Vec<ObjectHandle>) {
        match self {
            Self::Ref(handle) => out.push(handle.clone()),
            Self::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            Self::Map(map) => map.values().for_each(|v| v.collect_refs(out)),
            Self::Record(record) => record.fields.values().for_each(|v| v.collect_refs(out)),
            _ => {}
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i32 => Int,
    i64 => Int,
    u32 => Int,
    f64 => Float,
    String => Text,
    &str => Text,
    Decimal => Decimal,
    DateTime<Utc> => DateTime,
    NaiveDate => Date,
    NaiveTime => Time,
    Vec<Value> => List,
    BTreeMap<String, Value> => Map,
    Record => Record,
    ObjectHandle => Ref,
}

impl From<&ObjectHandle> for Value {
    fn from(handle: &ObjectHandle) -> Self {
        Self::Ref(handle.clone())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
