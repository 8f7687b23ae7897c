//! Explicit registry of persistent classes and record types.

use crate::codec::serializer::{ObjectHooks, ValueSerializer};
use crate::codec::{CLASS_KEY, RESERVED_TAGS};
use crate::error::{CoreError, CoreResult};
use crate::object::Value;
use indexmap::IndexMap;
use std::sync::Arc;

/// Declared shape of one field.
///
/// Fields without a declaration accept any value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Any value.
    Any,
    /// Boolean.
    Bool,
    /// Integer.
    Int,
    /// Float. Integers are accepted too.
    Float,
    /// Text.
    Text,
    /// Exact decimal.
    Decimal,
    /// UTC instant.
    DateTime,
    /// Calendar date.
    Date,
    /// Wall-clock time.
    Time,
    /// List whose items have the given kind.
    List(Box<FieldKind>),
    /// Map whose values have the given kind.
    Map(Box<FieldKind>),
    /// Record of the named type.
    Record(String),
    /// Reference to an object stored in the named class's table.
    Ref(String),
    /// The given kind, or null.
    Optional(Box<FieldKind>),
}

impl FieldKind {
    /// Shorthand for [`FieldKind::List`].
    #[must_use]
    pub fn list(item: FieldKind) -> Self {
        Self::List(Box::new(item))
    }

    /// Shorthand for [`FieldKind::Map`].
    #[must_use]
    pub fn map(value: FieldKind) -> Self {
        Self::Map(Box::new(value))
    }

    /// Shorthand for [`FieldKind::Optional`].
    #[must_use]
    pub fn optional(inner: FieldKind) -> Self {
        Self::Optional(Box::new(inner))
    }

    /// Shorthand for [`FieldKind::Ref`].
    pub fn reference(class: impl Into<String>) -> Self {
        Self::Ref(class.into())
    }

    /// Shorthand for [`FieldKind::Record`].
    pub fn record(name: impl Into<String>) -> Self {
        Self::Record(name.into())
    }

    /// Returns true if `value` has this shape.
    pub(crate) fn accepts(&self, value: &Value, registry: &TypeRegistry) -> bool {
        match (self, value) {
            (Self::Any, _) => true,
            (Self::Optional(_), Value::Null) => true,
            (Self::Optional(inner), v) => inner.accepts(v, registry),
            (Self::Bool, Value::Bool(_))
            | (Self::Int, Value::Int(_))
            | (Self::Float, Value::Float(_) | Value::Int(_))
            | (Self::Text, Value::Text(_))
            | (Self::Decimal, Value::Decimal(_))
            | (Self::DateTime, Value::DateTime(_))
            | (Self::Date, Value::Date(_))
            | (Self::Time, Value::Time(_)) => true,
            (Self::List(item), Value::List(items)) => {
                items.iter().all(|v| item.accepts(v, registry))
            }
            (Self::Map(inner), Value::Map(map)) => map.values().all(|v| inner.accepts(v, registry)),
            (Self::Record(name), Value::Record(record)) => record.name() == name,
            (Self::Ref(class), Value::Ref(handle)) => {
                let target = handle.table().or_else(|| {
                    registry
                        .table_of(&handle.class())
                        .map(ToString::to_string)
                });
                target.is_some() && target.as_deref() == registry.table_of(class)
            }
            _ => false,
        }
    }
}

/// A persistent class: the shape of objects stored in one table.
///
/// A class with a parent shares the parent's table. Documents record their
/// concrete class, so reading through the parent yields the subclass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    name: String,
    table: String,
    parent: Option<String>,
    fields: IndexMap<String, FieldKind>,
}

impl ClassInfo {
    /// Declares a class stored in `table`.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            parent: None,
            fields: IndexMap::new(),
        }
    }

    /// Declares the parent class. The table must match the parent's.
    #[must_use]
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Declares the shape of a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    /// Returns the class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the parent class name.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Returns the fields declared on this class itself.
    #[must_use]
    pub fn fields(&self) -> &IndexMap<String, FieldKind> {
        &self.fields
    }
}

/// A fixed-shape value type inlined into documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    name: String,
    fields: IndexMap<String, FieldKind>,
}

impl RecordInfo {
    /// Declares a record type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: IndexMap::new(),
        }
    }

    /// Declares a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    /// Returns the record name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the declared fields.
    #[must_use]
    pub fn fields(&self) -> &IndexMap<String, FieldKind> {
        &self.fields
    }
}

/// Registry of classes, record types, value serializers and class hooks.
///
/// Built once at startup and shared by reference; nothing in docjar keeps
/// global type state.
///
/// # Example
///
/// ```rust
/// use docjar_core::{ClassInfo, FieldKind, TypeRegistry};
///
/// let mut registry = TypeRegistry::new();
/// registry
///     .register_class(ClassInfo::new("Person", "person").field("name", FieldKind::Text))
///     .unwrap();
/// registry
///     .register_class(ClassInfo::new("Employee", "person").extends("Person"))
///     .unwrap();
///
/// assert_eq!(registry.table_of("Employee"), Some("person"));
/// assert!(registry.is_subclass("Employee", "Person"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    classes: IndexMap<String, ClassInfo>,
    records: IndexMap<String, RecordInfo>,
    /// Table name to the root class stored in it.
    tables: IndexMap<String, String>,
    serializers: IndexMap<String, Arc<dyn ValueSerializer>>,
    hooks: IndexMap<String, Arc<dyn ObjectHooks>>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class.
    ///
    /// # Errors
    ///
    /// Fails if the name is taken, the parent is unknown or lives in another
    /// table, or the table already belongs to an unrelated class.
    pub fn register_class(&mut self, class: ClassInfo) -> CoreResult<()> {
        if self.classes.contains_key(&class.name) {
            return Err(CoreError::invalid_operation(format!(
                "class {} is already registered",
                class.name
            )));
        }
        if class.fields.contains_key(CLASS_KEY) {
            return Err(CoreError::invalid_operation(format!(
                "class {} declares reserved field {CLASS_KEY}",
                class.name
            )));
        }

        match &class.parent {
            Some(parent) => {
                let info = self.classes.get(parent).ok_or_else(|| {
                    CoreError::invalid_operation(format!("unknown parent class {parent}"))
                })?;
                if info.table != class.table {
                    return Err(CoreError::invalid_operation(format!(
                        "class {} must be stored in its parent's table {}",
                        class.name, info.table
                    )));
                }
            }
            None => {
                if let Some(root) = self.tables.get(&class.table) {
                    return Err(CoreError::invalid_operation(format!(
                        "table {} already stores class {root}; declare {} as its subclass",
                        class.table, class.name
                    )));
                }
                self.tables.insert(class.table.clone(), class.name.clone());
            }
        }

        self.classes.insert(class.name.clone(), class);
        Ok(())
    }

    /// Registers a record type.
    ///
    /// # Errors
    ///
    /// Fails if the name is taken or is one of the built-in value tags.
    pub fn register_record(&mut self, record: RecordInfo) -> CoreResult<()> {
        if RESERVED_TAGS.contains(&record.name.as_str()) {
            return Err(CoreError::invalid_operation(format!(
                "{} is a reserved value tag",
                record.name
            )));
        }
        if self.records.contains_key(&record.name) || self.serializers.contains_key(&record.name) {
            return Err(CoreError::invalid_operation(format!(
                "value tag {} is already registered",
                record.name
            )));
        }
        self.records.insert(record.name.clone(), record);
        Ok(())
    }

    /// Registers a value serializer under its tag.
    ///
    /// Serializers are consulted in registration order, before the
    /// built-in value shapes.
    ///
    /// # Errors
    ///
    /// Fails if the tag is a built-in value tag or already names a record
    /// or another serializer.
    pub fn register_serializer(&mut self, serializer: Arc<dyn ValueSerializer>) -> CoreResult<()> {
        let tag = serializer.tag().to_string();
        if RESERVED_TAGS.contains(&tag.as_str()) {
            return Err(CoreError::invalid_operation(format!(
                "{tag} is a reserved value tag"
            )));
        }
        if self.records.contains_key(&tag) || self.serializers.contains_key(&tag) {
            return Err(CoreError::invalid_operation(format!(
                "value tag {tag} is already registered"
            )));
        }
        self.serializers.insert(tag, serializer);
        Ok(())
    }

    /// Registers lifecycle hooks for a class and its subclasses.
    ///
    /// # Errors
    ///
    /// Fails if the class is unknown or already has hooks.
    pub fn register_hooks(
        &mut self,
        class: &str,
        hooks: Arc<dyn ObjectHooks>,
    ) -> CoreResult<()> {
        if !self.classes.contains_key(class) {
            return Err(CoreError::invalid_operation(format!(
                "class {class} is not registered"
            )));
        }
        if self.hooks.contains_key(class) {
            return Err(CoreError::invalid_operation(format!(
                "class {class} already has hooks"
            )));
        }
        self.hooks.insert(class.to_string(), hooks);
        Ok(())
    }

    /// Returns the serializer owning a value tag.
    #[must_use]
    pub fn serializer(&self, tag: &str) -> Option<&Arc<dyn ValueSerializer>> {
        self.serializers.get(tag)
    }

    /// Returns the first serializer that encodes `value`.
    pub(crate) fn serializer_for(&self, value: &Value) -> Option<&Arc<dyn ValueSerializer>> {
        self.serializers.values().find(|s| s.can_write(value))
    }

    /// Returns the hooks of a class, inherited from the nearest ancestor
    /// that has any.
    #[must_use]
    pub fn hooks(&self, class: &str) -> Option<&Arc<dyn ObjectHooks>> {
        let mut current = self.classes.get(class);
        while let Some(info) = current {
            if let Some(hooks) = self.hooks.get(&info.name) {
                return Some(hooks);
            }
            current = info.parent.as_ref().and_then(|p| self.classes.get(p));
        }
        None
    }

    /// Looks up a class.
    #[must_use]
    pub fn class(&self, name: &str) -> Option<&ClassInfo> {
        self.classes.get(name)
    }

    /// Looks up a record type.
    #[must_use]
    pub fn record(&self, name: &str) -> Option<&RecordInfo> {
        self.records.get(name)
    }

    /// Returns the table a class is stored in.
    #[must_use]
    pub fn table_of(&self, class: &str) -> Option<&str> {
        self.classes.get(class).map(|c| c.table.as_str())
    }

    /// Returns the root class of a table.
    #[must_use]
    pub fn base_class(&self, table: &str) -> Option<&str> {
        self.tables.get(table).map(String::as_str)
    }

    /// Returns true if `class` is `ancestor` or derives from it.
    #[must_use]
    pub fn is_subclass(&self, class: &str, ancestor: &str) -> bool {
        let mut current = self.classes.get(class);
        while let Some(info) = current {
            if info.name == ancestor {
                return true;
            }
            current = info.parent.as_ref().and_then(|p| self.classes.get(p));
        }
        false
    }

    /// Returns the declared fields of a class and all its ancestors.
    #[must_use]
    pub fn declared_fields(&self, class: &str) -> IndexMap<&str, &FieldKind> {
        let mut chain = Vec::new();
        let mut current = self.classes.get(class);
        while let Some(info) = current {
            chain.push(info);
            current = info.parent.as_ref().and_then(|p| self.classes.get(p));
        }

        let mut fields = IndexMap::new();
        for info in chain.into_iter().rev() {
            for (name, kind) in &info.fields {
                fields.insert(name.as_str(), kind);
            }
        }
        fields
    }

    /// Returns the registered classes in registration order.
    pub fn classes(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectHandle, Record};

    fn registry() -> TypeRegistry {
        let mut r = TypeRegistry::new();
        r.register_class(ClassInfo::new("Foo", "foo").field("name", FieldKind::Text))
            .unwrap();
        r.register_class(
            ClassInfo::new("Sub", "foo")
                .extends("Foo")
                .field("n", FieldKind::Int),
        )
        .unwrap();
        r.register_class(ClassInfo::new("Bar", "bar")).unwrap();
        r.register_record(RecordInfo::new("Point").field("x", FieldKind::Int))
            .unwrap();
        r
    }

    #[test]
    fn subclass_shares_table() {
        let r = registry();
        assert_eq!(r.table_of("Sub"), Some("foo"));
        assert_eq!(r.base_class("foo"), Some("Foo"));
        assert!(r.is_subclass("Sub", "Foo"));
        assert!(!r.is_subclass("Foo", "Sub"));
        assert!(!r.is_subclass("Bar", "Foo"));
    }

    #[test]
    fn declared_fields_include_ancestors() {
        let r = registry();
        let fields = r.declared_fields("Sub");
        assert_eq!(fields.keys().copied().collect::<Vec<_>>(), ["name", "n"]);
    }

    #[test]
    fn rejects_bad_registrations() {
        let mut r = registry();
        assert!(r.register_class(ClassInfo::new("Foo", "x")).is_err());
        assert!(r.register_class(ClassInfo::new("Other", "foo")).is_err());
        assert!(r
            .register_class(ClassInfo::new("Sub2", "bar").extends("Foo"))
            .is_err());
        assert!(r.register_class(ClassInfo::new("X", "x").extends("Nope")).is_err());
        assert!(r.register_record(RecordInfo::new("ref")).is_err());
        assert!(r.register_record(RecordInfo::new("Point")).is_err());
    }

    #[test]
    fn field_kinds_accept_matching_values() {
        let r = registry();
        assert!(FieldKind::Float.accepts(&Value::Int(1), &r));
        assert!(!FieldKind::Int.accepts(&Value::Float(1.0), &r));
        assert!(FieldKind::optional(FieldKind::Text).accepts(&Value::Null, &r));
        assert!(FieldKind::list(FieldKind::Int).accepts(&Value::List(vec![Value::Int(1)]), &r));
        assert!(FieldKind::record("Point").accepts(&Value::Record(Record::new("Point")), &r));

        let sub = ObjectHandle::new("Sub");
        let bar = ObjectHandle::new("Bar");
        assert!(FieldKind::reference("Foo").accepts(&Value::from(&sub), &r));
        assert!(!FieldKind::reference("Foo").accepts(&Value::from(&bar), &r));
    }

    #[derive(Debug)]
    struct NoHooks;

    impl ObjectHooks for NoHooks {}

    #[test]
    fn hooks_are_inherited() {
        let mut r = registry();
        let hooks: Arc<dyn ObjectHooks> = Arc::new(NoHooks);
        r.register_hooks("Foo", Arc::clone(&hooks)).unwrap();
        assert!(Arc::ptr_eq(r.hooks("Sub").unwrap(), &hooks));
        assert!(r.hooks("Bar").is_none());
        assert!(r.register_hooks("Foo", Arc::new(NoHooks)).is_err());
        assert!(r.register_hooks("Nope", Arc::new(NoHooks)).is_err());
    }
}
