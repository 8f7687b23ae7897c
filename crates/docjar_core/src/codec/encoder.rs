//! Object to document encoding.

use crate::codec::registry::TypeRegistry;
use crate::codec::serializer::ValueSerializer;
use crate::codec::{
    ReferenceWriter, CLASS_KEY, TAG_DATE, TAG_DATETIME, TAG_DECIMAL, TAG_FLOAT, TAG_MAP, TAG_REF,
    TAG_TIME, TYPE_KEY,
};
use crate::error::{CoreError, CoreResult};
use crate::object::{Attributes, Record, Value};
use chrono::SecondsFormat;
use docjar_storage::Document;
use serde_json::{json, Map, Number, Value as Json};

/// Encoder for one document.
pub(crate) struct Encoder<'a> {
    registry: &'a TypeRegistry,
    refs: &'a mut dyn ReferenceWriter,
}

impl<'a> Encoder<'a> {
    pub(crate) fn new(registry: &'a TypeRegistry, refs: &'a mut dyn ReferenceWriter) -> Self {
        Self { registry, refs }
    }

    pub(crate) fn encode_object(
        &mut self,
        class: &str,
        attributes: &Attributes,
    ) -> CoreResult<Document> {
        if self.registry.class(class).is_none() {
            return Err(CoreError::invalid_operation(format!(
                "class {class} is not registered"
            )));
        }
        let declared = self.registry.declared_fields(class);

        let mut document = Document::new();
        document.insert(CLASS_KEY.to_string(), Json::String(class.to_string()));

        for (name, value) in attributes {
            if name == CLASS_KEY {
                return Err(CoreError::schema_mismatch(format!(
                    "attribute name {CLASS_KEY} is reserved"
                )));
            }
            if let Some(kind) = declared.get(name.as_str()) {
                if !kind.accepts(value, self.registry) {
                    return Err(CoreError::schema_mismatch(format!(
                        "{class}.{name} does not accept {value:?}"
                    )));
                }
            }
            document.insert(name.clone(), self.encode_value(value)?);
        }

        Ok(document)
    }

    pub(crate) fn encode_value(&mut self, value: &Value) -> CoreResult<Json> {
        // References always go through the reference writer.
        if !matches!(value, Value::Ref(_)) {
            if let Some(serializer) = self.registry.serializer_for(value) {
                return encode_custom(serializer.as_ref(), value);
            }
        }
        Ok(match value {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::Number((*n).into()),
            Value::Float(f) => match Number::from_f64(*f) {
                Some(n) => Json::Number(n),
                None => tagged(TAG_FLOAT, non_finite_name(*f)),
            },
            Value::Text(s) => Json::String(s.clone()),
            Value::Decimal(d) => tagged(TAG_DECIMAL, d.as_str()),
            Value::DateTime(dt) => tagged(TAG_DATETIME, dt.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            Value::Date(d) => tagged(TAG_DATE, d.to_string()),
            Value::Time(t) => tagged(TAG_TIME, t.to_string()),
            Value::List(items) => Json::Array(
                items
                    .iter()
                    .map(|v| self.encode_value(v))
                    .collect::<CoreResult<_>>()?,
            ),
            Value::Map(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.encode_value(v)?);
                }
                if out.contains_key(TYPE_KEY) {
                    json!({ TYPE_KEY: TAG_MAP, "value": out })
                } else {
                    Json::Object(out)
                }
            }
            Value::Record(record) => self.encode_record(record)?,
            Value::Ref(handle) => {
                let placeholder = self.refs.write_ref(handle)?;
                json!({
                    TYPE_KEY: TAG_REF,
                    "table": placeholder.table,
                    "id": placeholder.id.as_str(),
                })
            }
        })
    }

    fn encode_record(&mut self, record: &Record) -> CoreResult<Json> {
        let info = self.registry.record(record.name()).ok_or_else(|| {
            CoreError::schema_mismatch(format!("record {} is not registered", record.name()))
        })?;

        let declared = info.fields();
        let fields = record.fields();
        if declared.len() != fields.len() || !fields.keys().all(|k| declared.contains_key(k)) {
            return Err(CoreError::schema_mismatch(format!(
                "record {} fields {:?} do not match its declaration",
                record.name(),
                fields.keys().collect::<Vec<_>>()
            )));
        }

        let mut out = Map::new();
        out.insert(TYPE_KEY.to_string(), Json::String(record.name().to_string()));
        for (name, value) in fields {
            if !declared[name.as_str()].accepts(value, self.registry) {
                return Err(CoreError::schema_mismatch(format!(
                    "{}.{name} does not accept {value:?}",
                    record.name()
                )));
            }
            out.insert(name.clone(), self.encode_value(value)?);
        }
        Ok(Json::Object(out))
    }
}

fn encode_custom(serializer: &dyn ValueSerializer, value: &Value) -> CoreResult<Json> {
    let tag = serializer.tag();
    let state = serializer.write(value)?;
    if state.contains_key(TYPE_KEY) {
        return Err(CoreError::schema_mismatch(format!(
            "serializer {tag} wrote a state containing {TYPE_KEY}"
        )));
    }
    let mut out = Map::with_capacity(state.len() + 1);
    out.insert(TYPE_KEY.to_string(), Json::String(tag.to_string()));
    out.extend(state);
    Ok(Json::Object(out))
}

fn tagged(tag: &str, value: impl Into<Json>) -> Json {
    json!({ TYPE_KEY: tag, "value": value.into() })
}

fn non_finite_name(f: f64) -> &'static str {
    if f.is_nan() {
        "nan"
    } else if f > 0.0 {
        "inf"
    } else {
        "-inf"
    }
}
