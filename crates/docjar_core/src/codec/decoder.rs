//! Document to object decoding.

use crate::codec::registry::TypeRegistry;
use crate::codec::serializer::ValueSerializer;
use crate::codec::{
    Decoded, ReferenceReader, CLASS_KEY, TAG_DATE, TAG_DATETIME, TAG_DECIMAL, TAG_FLOAT, TAG_MAP,
    TAG_REF, TAG_TIME, TYPE_KEY,
};
use crate::error::{CoreError, CoreResult};
use crate::object::{Attributes, Decimal, Record, Value};
use crate::types::ObjectRef;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use docjar_storage::Document;
use serde_json::{Map, Number, Value as Json};
use std::collections::BTreeMap;

/// Decoder for one document.
pub(crate) struct Decoder<'a> {
    registry: &'a TypeRegistry,
    refs: &'a mut dyn ReferenceReader,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(registry: &'a TypeRegistry, refs: &'a mut dyn ReferenceReader) -> Self {
        Self { registry, refs }
    }

    pub(crate) fn decode_object(
        &mut self,
        document: &Document,
        target_class: &str,
    ) -> CoreResult<Decoded> {
        let class = document
            .get(CLASS_KEY)
            .and_then(Json::as_str)
            .ok_or_else(|| CoreError::schema_mismatch(format!("document has no {CLASS_KEY} tag")))?;

        if self.registry.class(class).is_none() {
            return Err(CoreError::schema_mismatch(format!(
                "unknown class tag {class}"
            )));
        }
        if !self.registry.is_subclass(class, target_class) {
            return Err(CoreError::schema_mismatch(format!(
                "document of class {class} cannot be read as {target_class}"
            )));
        }

        let declared = self.registry.declared_fields(class);
        let mut attributes = Attributes::new();
        for (name, json) in document {
            if name == CLASS_KEY {
                continue;
            }
            let value = self.decode_value(json)?;
            if let Some(kind) = declared.get(name.as_str()) {
                if !kind.accepts(&value, self.registry) {
                    return Err(CoreError::schema_mismatch(format!(
                        "stored {class}.{name} does not fit its declared kind {kind:?}"
                    )));
                }
            }
            attributes.insert(name.clone(), value);
        }

        Ok(Decoded {
            class: class.to_string(),
            attributes,
        })
    }

    pub(crate) fn decode_value(&mut self, json: &Json) -> CoreResult<Value> {
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => decode_number(n)?,
            Json::String(s) => Value::Text(s.clone()),
            Json::Array(items) => Value::List(
                items
                    .iter()
                    .map(|v| self.decode_value(v))
                    .collect::<CoreResult<_>>()?,
            ),
            Json::Object(map) => match map.get(TYPE_KEY) {
                None => Value::Map(self.decode_map(map)?),
                Some(Json::String(tag)) => self.decode_tagged(tag, map)?,
                Some(other) => {
                    return Err(CoreError::schema_mismatch(format!(
                        "value tag must be a string, found {other}"
                    )))
                }
            },
        })
    }

    fn decode_map(&mut self, map: &Map<String, Json>) -> CoreResult<BTreeMap<String, Value>> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.decode_value(v)?)))
            .collect()
    }

    fn decode_tagged(&mut self, tag: &str, map: &Map<String, Json>) -> CoreResult<Value> {
        match tag {
            TAG_REF => {
                let table = text_field(map, "table", tag)?;
                let id = text_field(map, "id", tag)?;
                let handle = self.refs.read_ref(&ObjectRef::new(table, id))?;
                Ok(Value::Ref(handle))
            }
            TAG_DATETIME => {
                let text = text_field(map, "value", tag)?;
                DateTime::parse_from_rfc3339(text)
                    .map(|dt| Value::DateTime(dt.with_timezone(&Utc)))
                    .map_err(|e| bad_literal(tag, text, &e))
            }
            TAG_DATE => {
                let text = text_field(map, "value", tag)?;
                text.parse::<NaiveDate>()
                    .map(Value::Date)
                    .map_err(|e| bad_literal(tag, text, &e))
            }
            TAG_TIME => {
                let text = text_field(map, "value", tag)?;
                text.parse::<NaiveTime>()
                    .map(Value::Time)
                    .map_err(|e| bad_literal(tag, text, &e))
            }
            TAG_DECIMAL => Decimal::parse(text_field(map, "value", tag)?).map(Value::Decimal),
            TAG_FLOAT => match text_field(map, "value", tag)? {
                "inf" => Ok(Value::Float(f64::INFINITY)),
                "-inf" => Ok(Value::Float(f64::NEG_INFINITY)),
                "nan" => Ok(Value::Float(f64::NAN)),
                other => Err(CoreError::schema_mismatch(format!(
                    "{other:?} is not a non-finite float"
                ))),
            },
            TAG_MAP => match map.get("value") {
                Some(Json::Object(inner)) => Ok(Value::Map(self.decode_map(inner)?)),
                _ => Err(CoreError::schema_mismatch("escaped map has no value object")),
            },
            name => match self.registry.serializer(name) {
                Some(serializer) => decode_custom(serializer.as_ref(), map),
                None => self.decode_record(name, map),
            },
        }
    }

    fn decode_record(&mut self, name: &str, map: &Map<String, Json>) -> CoreResult<Value> {
        let registry = self.registry;
        let info = registry
            .record(name)
            .ok_or_else(|| CoreError::schema_mismatch(format!("unknown value tag {name}")))?;

        let declared = info.fields();
        let stored = map.keys().filter(|k| *k != TYPE_KEY);
        if map.len() - 1 != declared.len() || !stored.clone().all(|k| declared.contains_key(k)) {
            return Err(CoreError::schema_mismatch(format!(
                "stored record {name} fields {:?} do not match its declaration",
                stored.collect::<Vec<_>>()
            )));
        }

        let mut fields = BTreeMap::new();
        for (field, json) in map {
            if field == TYPE_KEY {
                continue;
            }
            let value = self.decode_value(json)?;
            if !declared[field.as_str()].accepts(&value, registry) {
                return Err(CoreError::schema_mismatch(format!(
                    "stored {name}.{field} does not fit its declared kind"
                )));
            }
            fields.insert(field.clone(), value);
        }
        Ok(Value::Record(Record::from_fields(name, fields)))
    }
}

fn decode_custom(serializer: &dyn ValueSerializer, map: &Map<String, Json>) -> CoreResult<Value> {
    let mut state = map.clone();
    state.remove(TYPE_KEY);
    if !serializer.can_read(&state) {
        return Err(CoreError::schema_mismatch(format!(
            "serializer {} cannot read the stored state",
            serializer.tag()
        )));
    }
    serializer.read(&state)
}

fn decode_number(n: &Number) -> CoreResult<Value> {
    if let Some(i) = n.as_i64() {
        Ok(Value::Int(i))
    } else if n.is_u64() {
        Err(CoreError::schema_mismatch(format!(
            "integer {n} does not fit in 64 signed bits"
        )))
    } else {
        n.as_f64()
            .map(Value::Float)
            .ok_or_else(|| CoreError::schema_mismatch(format!("unsupported number {n}")))
    }
}

fn text_field<'m>(map: &'m Map<String, Json>, field: &str, tag: &str) -> CoreResult<&'m str> {
    map.get(field)
        .and_then(Json::as_str)
        .ok_or_else(|| CoreError::schema_mismatch(format!("{tag} value has no {field} text")))
}

fn bad_literal(tag: &str, text: &str, err: &dyn std::fmt::Display) -> CoreError {
    CoreError::schema_mismatch(format!("invalid {tag} {text:?}: {err}"))
}
