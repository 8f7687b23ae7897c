//! Opaque row filters.
//!
//! A [`Filter`] is handed to [`crate::Backend::query`] untouched by the data
//! manager. SQL backends render it into a `WHERE` clause over the document
//! column; the in-memory backend evaluates it directly with
//! [`Filter::matches`].
//!
//! Filters can be built programmatically or parsed from a Mongo-style query
//! document:
//!
//! ```
//! use docjar_storage::Filter;
//! use serde_json::json;
//!
//! let filter = Filter::from_query(&json!({
//!     "name": "foo",
//!     "size": {"$gt": 3},
//! }))
//! .unwrap();
//!
//! assert!(filter.matches(json!({"name": "foo", "size": 4}).as_object().unwrap()));
//! assert!(!filter.matches(json!({"name": "foo", "size": 2}).as_object().unwrap()));
//! ```

use crate::error::{StorageError, StorageResult};
use crate::row::Document;
use serde_json::Value as Json;
use std::cmp::Ordering;

/// A predicate over stored documents.
///
/// Paths are dotted (`"contract.week.day"`); numeric segments index into
/// arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every row.
    All,
    /// Field equals the value, or is an array containing it.
    Eq(String, Json),
    /// Negation of [`Filter::Eq`]; also matches missing fields.
    Ne(String, Json),
    /// Field is greater than the value.
    Gt(String, Json),
    /// Field is greater than or equal to the value.
    Gte(String, Json),
    /// Field is less than the value.
    Lt(String, Json),
    /// Field is less than or equal to the value.
    Lte(String, Json),
    /// Field equals any of the values.
    In(String, Vec<Json>),
    /// Field equals none of the values.
    Nin(String, Vec<Json>),
    /// Field presence.
    Exists(String, bool),
    /// All sub-filters match.
    And(Vec<Filter>),
    /// Any sub-filter matches.
    Or(Vec<Filter>),
    /// The sub-filter does not match.
    Not(Box<Filter>),
}

impl Filter {
    /// Equality filter.
    pub fn eq(path: impl Into<String>, value: impl Into<Json>) -> Self {
        Self::Eq(path.into(), value.into())
    }

    /// Greater-than filter.
    pub fn gt(path: impl Into<String>, value: impl Into<Json>) -> Self {
        Self::Gt(path.into(), value.into())
    }

    /// Less-than filter.
    pub fn lt(path: impl Into<String>, value: impl Into<Json>) -> Self {
        Self::Lt(path.into(), value.into())
    }

    /// Conjunction of this filter and another.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        match self {
            Self::All => other,
            Self::And(mut clauses) => {
                clauses.push(other);
                Self::And(clauses)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Parses a Mongo-style query document.
    ///
    /// Supported: scalar equality, `$eq`, `$ne`, `$gt`, `$gte`, `$lt`,
    /// `$lte`, `$in`, `$nin`, `$exists`, `$not` on a field, and top-level
    /// `$and` / `$or` arrays.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidFilter`] for anything else.
    pub fn from_query(query: &Json) -> StorageResult<Self> {
        let map = query
            .as_object()
            .ok_or_else(|| StorageError::invalid_filter("query must be an object"))?;

        let mut clauses = Vec::with_capacity(map.len());
        for (key, value) in map {
            match key.as_str() {
                "$and" => clauses.push(Self::And(Self::parse_list(key, value)?)),
                "$or" => clauses.push(Self::Or(Self::parse_list(key, value)?)),
                k if k.starts_with('$') => {
                    return Err(StorageError::invalid_filter(format!(
                        "unsupported top-level operator {k}"
                    )))
                }
                path => clauses.push(Self::parse_field(path, value)?),
            }
        }

        Ok(match clauses.len() {
            0 => Self::All,
            1 => clauses.remove(0),
            _ => Self::And(clauses),
        })
    }

    fn parse_list(op: &str, value: &Json) -> StorageResult<Vec<Self>> {
        value
            .as_array()
            .ok_or_else(|| StorageError::invalid_filter(format!("{op} expects an array")))?
            .iter()
            .map(Self::from_query)
            .collect()
    }

    fn parse_field(path: &str, value: &Json) -> StorageResult<Self> {
        let operators = match value.as_object() {
            Some(obj) if !obj.is_empty() && obj.keys().all(|k| k.starts_with('$')) => obj,
            _ => return Ok(Self::Eq(path.to_string(), value.clone())),
        };

        let mut clauses = Vec::with_capacity(operators.len());
        for (op, operand) in operators {
            let p = path.to_string();
            let clause = match op.as_str() {
                "$eq" => Self::Eq(p, operand.clone()),
                "$ne" => Self::Ne(p, operand.clone()),
                "$gt" => Self::Gt(p, operand.clone()),
                "$gte" => Self::Gte(p, operand.clone()),
                "$lt" => Self::Lt(p, operand.clone()),
                "$lte" => Self::Lte(p, operand.clone()),
                "$in" | "$nin" => {
                    let values = operand.as_array().cloned().ok_or_else(|| {
                        StorageError::invalid_filter(format!("{op} expects an array"))
                    })?;
                    if op == "$in" {
                        Self::In(p, values)
                    } else {
                        Self::Nin(p, values)
                    }
                }
                "$exists" => {
                    let flag = operand.as_bool().ok_or_else(|| {
                        StorageError::invalid_filter("$exists expects a boolean")
                    })?;
                    Self::Exists(p, flag)
                }
                "$not" => Self::Not(Box::new(Self::parse_field(path, operand)?)),
                other => {
                    return Err(StorageError::invalid_filter(format!(
                        "unsupported operator {other}"
                    )))
                }
            };
            clauses.push(clause);
        }

        Ok(if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Self::And(clauses)
        })
    }

    /// Evaluates the filter against a document.
    #[must_use]
    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Self::All => true,
            Self::Eq(path, value) => lookup(document, path).is_some_and(|f| json_eq(f, value)),
            Self::Ne(path, value) => !lookup(document, path).is_some_and(|f| json_eq(f, value)),
            Self::Gt(path, value) => compare(document, path, value) == Some(Ordering::Greater),
            Self::Gte(path, value) => matches!(
                compare(document, path, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lt(path, value) => compare(document, path, value) == Some(Ordering::Less),
            Self::Lte(path, value) => matches!(
                compare(document, path, value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::In(path, values) => lookup(document, path)
                .is_some_and(|f| values.iter().any(|v| json_eq(f, v))),
            Self::Nin(path, values) => !lookup(document, path)
                .is_some_and(|f| values.iter().any(|v| json_eq(f, v))),
            Self::Exists(path, wanted) => lookup(document, path).is_some() == *wanted,
            Self::And(clauses) => clauses.iter().all(|c| c.matches(document)),
            Self::Or(clauses) => clauses.iter().any(|c| c.matches(document)),
            Self::Not(inner) => !inner.matches(document),
        }
    }
}

fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Json> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Json::Object(map) => map.get(segment)?,
            Json::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn json_eq(field: &Json, value: &Json) -> bool {
    if scalar_eq(field, value) {
        return true;
    }
    match field {
        Json::Array(items) if !value.is_array() => items.iter().any(|i| scalar_eq(i, value)),
        _ => false,
    }
}

fn scalar_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

fn compare(document: &Document, path: &str, value: &Json) -> Option<Ordering> {
    match (lookup(document, path)?, value) {
        (Json::Number(a), Json::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Json::String(a), Json::String(b)) => Some(a.cmp(b)),
        (Json::Bool(a), Json::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
