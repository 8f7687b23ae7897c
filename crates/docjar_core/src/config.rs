//! Data manager configuration.

use serde::{Deserialize, Serialize};

/// Lifetime of the identity cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    /// The cache is cleared at every transaction boundary. Handles from a
    /// finished transaction must not be used in the next one.
    #[default]
    Transaction,
    /// Handles survive across transactions of one data manager and are
    /// revalidated against the stored version on first access. Above
    /// [`Config::cache_capacity`] entries, handles nobody else holds are
    /// dropped at the next transaction boundary, oldest first.
    Manager,
}

/// How references are resolved when objects are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMode {
    /// References become hollow handles loaded on first access.
    #[default]
    Lazy,
    /// `get` and `find` load the whole reachable graph and reject cycles.
    Eager,
}

/// Default [`Config::cache_capacity`].
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Configuration for a data manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Lifetime of the identity cache.
    pub cache_scope: CacheScope,

    /// Number of entries a manager-scoped cache is trimmed back to at a
    /// transaction boundary. Handles still held outside the cache are
    /// never dropped, so the cache can stay above this.
    pub cache_capacity: usize,

    /// Whether referencing a new object registers it for insertion.
    pub cascade_inserts: bool,

    /// Whether loaded versions are compared against stored ones at commit.
    pub conflict_detection: bool,

    /// How references are resolved on read.
    pub resolve_mode: ResolveMode,

    /// Whether objects whose document did not change are left unwritten.
    pub skip_unchanged_writes: bool,

    /// Whether pending changes are flushed before running a query.
    pub flush_before_query: bool,

    /// Whether backend calls are timed and kept for the query report.
    pub record_queries: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_scope: CacheScope::Transaction,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cascade_inserts: true,
            conflict_detection: true,
            resolve_mode: ResolveMode::Lazy,
            skip_unchanged_writes: true,
            flush_before_query: true,
            record_queries: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the identity cache lifetime.
    #[must_use]
    pub const fn cache_scope(mut self, scope: CacheScope) -> Self {
        self.cache_scope = scope;
        self
    }

    /// Sets the capacity of a manager-scoped cache.
    #[must_use]
    pub const fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets whether new referenced objects are inserted automatically.
    #[must_use]
    pub const fn cascade_inserts(mut self, value: bool) -> Self {
        self.cascade_inserts = value;
        self
    }

    /// Sets whether optimistic conflict detection runs at commit.
    #[must_use]
    pub const fn conflict_detection(mut self, value: bool) -> Self {
        self.conflict_detection = value;
        self
    }

    /// Sets the reference resolution mode.
    #[must_use]
    pub const fn resolve_mode(mut self, mode: ResolveMode) -> Self {
        self.resolve_mode = mode;
        self
    }

    /// Sets whether unchanged documents are skipped on flush.
    #[must_use]
    pub const fn skip_unchanged_writes(mut self, value: bool) -> Self {
        self.skip_unchanged_writes = value;
        self
    }

    /// Sets whether queries flush pending changes first.
    #[must_use]
    pub const fn flush_before_query(mut self, value: bool) -> Self {
        self.flush_before_query = value;
        self
    }

    /// Sets whether backend calls are recorded.
    #[must_use]
    pub const fn record_queries(mut self, value: bool) -> Self {
        self.record_queries = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.cache_scope, CacheScope::Transaction);
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert!(config.cascade_inserts);
        assert!(config.conflict_detection);
        assert!(config.skip_unchanged_writes);
        assert!(!config.record_queries);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .cache_scope(CacheScope::Manager)
            .cascade_inserts(false)
            .resolve_mode(ResolveMode::Eager);

        assert_eq!(config.cache_scope, CacheScope::Manager);
        assert!(!config.cascade_inserts);
        assert_eq!(config.resolve_mode, ResolveMode::Eager);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"cache_scope": "manager", "record_queries": true}"#)
                .unwrap();
        assert_eq!(config.cache_scope, CacheScope::Manager);
        assert!(config.record_queries);
        assert!(config.flush_before_query);
    }
}
