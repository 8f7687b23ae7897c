//! # Docjar Core
//!
//! Object persistence for Docjar.
//!
//! This crate maps graphs of in-memory objects to rows of a document store:
//! - Type registry and codec between objects and JSON documents, with
//!   pluggable value serializers and per-class lifecycle hooks
//! - Identity cache, one live handle per stored row
//! - Reference resolution with lazy or eager loading
//! - Data manager with two-phase commit, savepoints and optimistic
//!   conflict detection
//! - Call statistics and a query report
//!
//! # Example
//!
//! ```rust
//! use docjar_core::{ClassInfo, Config, DataManager, ObjectHandle, TypeRegistry};
//! use docjar_storage::InMemoryStore;
//! use std::sync::Arc;
//!
//! let mut registry = TypeRegistry::new();
//! registry.register_class(ClassInfo::new("Person", "person")).unwrap();
//! let registry = Arc::new(registry);
//!
//! let store = InMemoryStore::shared();
//! let mut dm = DataManager::new(store.connect(), Arc::clone(&registry), Config::default());
//!
//! let person = ObjectHandle::new("Person").with("name", "stephan");
//! let reference = dm.insert(&person, None).unwrap();
//! dm.commit().unwrap();
//!
//! dm.reset().unwrap();
//! let loaded = dm.get(&reference.table, reference.id.clone()).unwrap().unwrap();
//! assert_eq!(loaded.get("name").unwrap(), Some("stephan".into()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod codec;
mod config;
mod conflict;
mod error;
mod manager;
mod object;
mod reference;
mod stats;
mod types;

pub use cache::IdentityCache;
pub use codec::{
    ClassInfo, Codec, Decoded, FieldKind, ObjectHooks, RecordInfo, ReferenceReader,
    ReferenceWriter, TypeRegistry, ValueSerializer, CLASS_KEY, RESERVED_TAGS, TYPE_KEY,
};
pub use config::{CacheScope, Config, ResolveMode, DEFAULT_CACHE_CAPACITY};
pub use conflict::{Conflict, ConflictDetector};
pub use error::{CoreError, CoreResult};
pub use manager::{DataManager, Savepoint, TxnStatus};
pub use object::{Attributes, Decimal, ObjectHandle, Record, Value};
pub use reference::ReferenceResolver;
pub use stats::{
    ManagerStats, Operation, QueryRecord, QueryReport, QueryTotals, StatsSnapshot, REPORT_TOP,
};
pub use types::{ObjectRef, TransactionId};

pub use docjar_storage::{
    Backend, Document, Filter, InMemoryBackend, InMemoryStore, ObjectId, Row, StorageError,
    StorageResult, Version, VersionScheme, WriteOutcome,
};
