//! # Docjar Testkit
//!
//! Test utilities for docjar.
//!
//! This crate provides:
//! - A shared in-memory store, the test type registry and tracing setup
//! - Property-based test generators using proptest
//! - Golden documents for format verification
//! - Cross-crate integration test helpers
//! - Concurrent stress tests for optimistic concurrency
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docjar_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_store() {
//!     with_store(|store| {
//!         let mut dm = store.dm();
//!         // ... test operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod golden;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::golden::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use golden::*;
pub use integration::*;
pub use stress::*;
