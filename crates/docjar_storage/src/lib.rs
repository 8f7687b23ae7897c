//! # docjar storage
//!
//! Row store contract and backends for docjar.
//!
//! This crate is the lowest layer of docjar. A backend stores rows of the
//! form `(id, document, version)` in named tables. Backends know nothing
//! about classes, references or object identity; the data manager in
//! `docjar_core` owns all of that.
//!
//! ## Design Principles
//!
//! - Documents are plain JSON objects
//! - Versions are opaque and only compared for equality
//! - Transactions are SERIALIZABLE; the first committer wins
//! - Errors are reported as [`StorageError`] and surfaced unchanged
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - A connection to a shared [`InMemoryStore`]
//!
//! ## Example
//!
//! ```rust
//! use docjar_storage::{Backend, Filter, InMemoryStore, ObjectId};
//! use serde_json::json;
//!
//! let store = InMemoryStore::shared();
//! let mut conn = store.connect();
//! conn.begin().unwrap();
//!
//! let doc = json!({"name": "foo"}).as_object().cloned().unwrap();
//! conn.insert_row("foo", &ObjectId::new("1"), doc).unwrap();
//!
//! let rows = conn.query("foo", &Filter::eq("name", "foo")).unwrap();
//! assert_eq!(rows.len(), 1);
//! conn.commit().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod filter;
mod memory;
mod row;

pub use backend::Backend;
pub use error::{StorageError, StorageResult};
pub use filter::Filter;
pub use memory::{InMemoryBackend, InMemoryStore};
pub use row::{Document, ObjectId, Row, Version, VersionScheme, WriteOutcome};
