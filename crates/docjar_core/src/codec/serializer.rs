//! Pluggable value serializers and object lifecycle hooks.

use crate::error::CoreResult;
use crate::object::{ObjectHandle, Value};
use docjar_storage::Document;
use serde_json::{Map, Value as Json};
use std::fmt;

/// Custom document representation for a family of values.
///
/// A serializer owns one value tag. While encoding, registered serializers
/// are asked in registration order whether they take a value, before the
/// built-in shapes are tried. The state a serializer returns is stored
/// under its tag:
///
/// ```json
/// {"_type": "money", "amount": "10.25", "currency": "EUR"}
/// ```
///
/// While decoding, a tagged object whose tag names a serializer is handed
/// to it with the tag removed. State is plain JSON; it is not passed through
/// the codec, so it cannot hold object references.
///
/// # Example
///
/// ```rust
/// use docjar_core::{CoreResult, Record, Value, ValueSerializer};
/// use serde_json::{Map, Value as Json};
///
/// /// Stores `Point` records as a compact `"x,y"` string.
/// #[derive(Debug)]
/// struct CompactPoint;
///
/// impl ValueSerializer for CompactPoint {
///     fn tag(&self) -> &str {
///         "xy"
///     }
///
///     fn can_write(&self, value: &Value) -> bool {
///         value.as_record().is_some_and(|r| r.name() == "Point")
///     }
///
///     fn write(&self, value: &Value) -> CoreResult<Map<String, Json>> {
///         let record = value.as_record().expect("checked by can_write");
///         let coord = |f: &str| record.get(f).and_then(Value::as_int).unwrap_or(0);
///         let mut state = Map::new();
///         state.insert("v".into(), format!("{},{}", coord("x"), coord("y")).into());
///         Ok(state)
///     }
///
///     fn read(&self, state: &Map<String, Json>) -> CoreResult<Value> {
///         let text = state.get("v").and_then(Json::as_str).unwrap_or("0,0");
///         let (x, y) = text.split_once(',').unwrap_or(("0", "0"));
///         let point = Record::new("Point")
///             .with("x", x.parse::<i64>().unwrap_or(0))
///             .with("y", y.parse::<i64>().unwrap_or(0));
///         Ok(Value::Record(point))
///     }
/// }
/// ```
pub trait ValueSerializer: fmt::Debug + Send + Sync {
    /// Returns the value tag this serializer owns.
    fn tag(&self) -> &str;

    /// Returns true if this serializer encodes `value`.
    fn can_write(&self, value: &Value) -> bool;

    /// Returns true if this serializer decodes `state`. Stored state that
    /// is refused here is a schema mismatch.
    fn can_read(&self, state: &Map<String, Json>) -> bool {
        let _ = state;
        true
    }

    /// Returns the stored state of a value accepted by
    /// [`can_write`](Self::can_write). The state must not contain the
    /// `_type` key.
    ///
    /// # Errors
    ///
    /// Fails if the value cannot be represented.
    fn write(&self, value: &Value) -> CoreResult<Map<String, Json>>;

    /// Rebuilds a value from its stored state.
    ///
    /// # Errors
    ///
    /// Fails if the state is malformed.
    fn read(&self, state: &Map<String, Json>) -> CoreResult<Value>;
}

/// Callbacks run by the data manager around the storage of one class.
///
/// Hooks registered for a class also apply to its subclasses. They run
/// while the data manager is busy, so they only see the handle.
pub trait ObjectHooks: fmt::Debug + Send + Sync {
    /// Runs after the object's document was written to the backend.
    fn after_store(&self, handle: &ObjectHandle, document: &Document) {
        let _ = (handle, document);
    }

    /// Runs after the object's attributes were loaded from a stored row.
    fn after_load(&self, handle: &ObjectHandle) {
        let _ = handle;
    }
}
