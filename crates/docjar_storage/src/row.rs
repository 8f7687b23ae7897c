//! Row-level types shared by every backend.

use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// A stored document: the JSON object held in a row's document column.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Primary key of a row.
///
/// Keys are opaque strings. Generated keys are v4 UUIDs, but callers may
/// insert rows under any explicit key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(String);

impl ObjectId {
    /// Creates an id from an explicit key.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ObjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// How a backend stamps row versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionScheme {
    /// Monotonic per-row counter starting at 1.
    #[default]
    Counter,
    /// SHA-256 of the canonical document.
    ContentHash,
}

impl VersionScheme {
    /// Version for a freshly inserted row.
    #[must_use]
    pub fn initial(self, document: &Document) -> Version {
        match self {
            Self::Counter => Version::counter(1),
            Self::ContentHash => Version::digest_of(document),
        }
    }

    /// Version for a row replacing `previous`.
    #[must_use]
    pub fn next(self, previous: &Version, document: &Document) -> Version {
        match self {
            Self::Counter => Version::counter(previous.as_counter().unwrap_or(0) + 1),
            Self::ContentHash => Version::digest_of(document),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum Stamp {
    Counter(u64),
    Digest(String),
}

/// Opaque version stamp attached to a row at write time.
///
/// Versions are only ever compared for equality.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Version(Stamp);

impl Version {
    /// Creates a counter version.
    #[must_use]
    pub const fn counter(value: u64) -> Self {
        Self(Stamp::Counter(value))
    }

    /// Creates a content-hash version for a document.
    #[must_use]
    pub fn digest_of(document: &Document) -> Self {
        // serde_json maps are key-sorted, so this is canonical.
        let bytes = serde_json::to_vec(document).unwrap_or_default();
        let hash = Sha256::digest(&bytes);
        let hex = hash.iter().map(|b| format!("{b:02x}")).collect::<String>();
        Self(Stamp::Digest(hex))
    }

    /// Returns the counter value, if this is a counter version.
    #[must_use]
    pub fn as_counter(&self) -> Option<u64> {
        match &self.0 {
            Stamp::Counter(n) => Some(*n),
            Stamp::Digest(_) => None,
        }
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({self})")
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Stamp::Counter(n) => write!(f, "{n}"),
            Stamp::Digest(hex) => f.write_str(&hex[..12.min(hex.len())]),
        }
    }
}

/// A row as returned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Primary key.
    pub id: ObjectId,
    /// Document column.
    pub document: Document,
    /// Version column.
    pub version: Version,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome<T> {
    /// The write was applied.
    Applied(T),
    /// The expected version did not match; nothing was written.
    Conflict {
        /// Version currently stored, `None` if the row is gone.
        current: Option<Version>,
    },
}

impl<T> WriteOutcome<T> {
    /// Returns true if the write was applied.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}
