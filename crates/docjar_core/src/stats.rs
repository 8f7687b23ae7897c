//! Data manager statistics and query timing.
//!
//! Counters are always maintained. Per-call timings are only kept when
//! [`Config::record_queries`](crate::Config::record_queries) is set.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut dm = DataManager::new(store.connect(), registry, Config::new().record_queries(true));
//!
//! // Perform operations...
//! dm.find("person", &Filter::All)?;
//!
//! let stats = dm.stats();
//! println!("Queries: {}", stats.queries);
//! println!("{}", dm.query_report().report());
//! ```

use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of entries shown by [`QueryReport::report`].
pub const REPORT_TOP: usize = 10;

/// Kind of backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Single row read.
    Fetch,
    /// Row insert.
    Insert,
    /// Row update.
    Update,
    /// Row delete.
    Delete,
    /// Filtered table scan.
    Query,
    /// Savepoint creation or rollback.
    Savepoint,
}

impl Operation {
    /// Returns a short lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Query => "query",
            Self::Savepoint => "savepoint",
        }
    }
}

/// One timed backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    /// Kind of call.
    pub operation: Operation,
    /// Table the call touched.
    pub table: String,
    /// Wall time spent in the backend.
    pub elapsed: Duration,
}

/// Data manager statistics.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct ManagerStats {
    fetches: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    queries: AtomicU64,
    skipped_writes: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    conflicts: AtomicU64,
    records: Mutex<Vec<QueryRecord>>,
}

impl ManagerStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    // === Increment methods (internal use) ===

    /// Records a backend call, keeping its timing if `keep` is set.
    pub(crate) fn record_call(&self, operation: Operation, table: &str, elapsed: Duration, keep: bool) {
        let counter = match operation {
            Operation::Fetch => Some(&self.fetches),
            Operation::Insert => Some(&self.inserts),
            Operation::Update => Some(&self.updates),
            Operation::Delete => Some(&self.deletes),
            Operation::Query => Some(&self.queries),
            Operation::Savepoint => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        if keep {
            self.records.lock().push(QueryRecord {
                operation,
                table: table.to_string(),
                elapsed,
            });
        }
    }

    /// Records a write skipped because the document did not change.
    pub(crate) fn record_skipped_write(&self) {
        self.skipped_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a transaction commit.
    pub(crate) fn record_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a transaction abort.
    pub(crate) fn record_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a detected conflict.
    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    // === Getter methods (public API) ===

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fetches: self.fetches.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            skipped_writes: self.skipped_writes.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_aborted: self.transactions_aborted.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }

    /// Returns the timed calls recorded so far.
    pub fn report(&self) -> QueryReport {
        QueryReport {
            records: self.records.lock().clone(),
        }
    }

    /// Drops the timed calls recorded so far.
    pub fn clear_records(&self) {
        self.records.lock().clear();
    }
}

/// A point-in-time snapshot of data manager statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Single row reads.
    pub fetches: u64,
    /// Rows inserted.
    pub inserts: u64,
    /// Rows updated.
    pub updates: u64,
    /// Rows deleted.
    pub deletes: u64,
    /// Table queries.
    pub queries: u64,
    /// Flushed objects left unwritten because nothing changed.
    pub skipped_writes: u64,
    /// Committed transactions.
    pub transactions_committed: u64,
    /// Aborted transactions.
    pub transactions_aborted: u64,
    /// Conflicts detected at flush.
    pub conflicts: u64,
}

/// Totals over a set of timed calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTotals {
    /// Number of calls.
    pub count: usize,
    /// Sum of elapsed time.
    pub total: Duration,
    /// Calls, most expensive first.
    pub entries: Vec<QueryRecord>,
}

/// Timed backend calls of a data manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryReport {
    records: Vec<QueryRecord>,
}

impl QueryReport {
    /// Returns the calls in the order they were made.
    #[must_use]
    pub fn records(&self) -> &[QueryRecord] {
        &self.records
    }

    /// Computes totals.
    #[must_use]
    pub fn totals(&self) -> QueryTotals {
        let mut entries = self.records.clone();
        entries.sort_by(|a, b| b.elapsed.cmp(&a.elapsed));
        QueryTotals {
            count: entries.len(),
            total: entries.iter().map(|r| r.elapsed).sum(),
            entries,
        }
    }

    /// Renders the most expensive calls followed by the call count and
    /// total time.
    #[must_use]
    pub fn report(&self) -> String {
        let totals = self.totals();
        let mut out = String::new();
        for (rank, entry) in totals.entries.iter().take(REPORT_TOP).enumerate() {
            let _ = writeln!(
                out,
                "{:>2}. {:<9} {:<24} {:.3}ms",
                rank + 1,
                entry.operation.as_str(),
                entry.table,
                entry.elapsed.as_secs_f64() * 1000.0
            );
        }
        let _ = writeln!(out, "Number of calls: {}", totals.count);
        let _ = write!(
            out,
            "Total time: {:.3}ms",
            totals.total.as_secs_f64() * 1000.0
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let stats = ManagerStats::new();
        stats.record_call(Operation::Fetch, "foo", Duration::ZERO, false);
        stats.record_call(Operation::Insert, "foo", Duration::ZERO, false);
        stats.record_commit();
        stats.record_conflict();

        let snap = stats.snapshot();
        assert_eq!(snap.fetches, 1);
        assert_eq!(snap.inserts, 1);
        assert_eq!(snap.transactions_committed, 1);
        assert_eq!(snap.conflicts, 1);
        assert!(stats.report().records().is_empty());
    }

    #[test]
    fn totals_sort_by_cost() {
        let stats = ManagerStats::new();
        for ms in [3, 1, 2] {
            stats.record_call(Operation::Query, "foo", Duration::from_millis(ms), true);
        }
        let totals = stats.report().totals();
        assert_eq!(totals.count, 3);
        assert_eq!(totals.total, Duration::from_millis(6));
        assert_eq!(totals.entries[0].elapsed, Duration::from_millis(3));
        assert_eq!(totals.entries[2].elapsed, Duration::from_millis(1));
    }

    #[test]
    fn report_shows_top_ten() {
        let stats = ManagerStats::new();
        for ms in 0..15 {
            stats.record_call(Operation::Update, "bar", Duration::from_millis(ms), true);
        }
        let report = stats.report().report();
        assert_eq!(report.lines().count(), REPORT_TOP + 2);
        assert!(report.starts_with(" 1. update"));
        assert!(report.contains("Number of calls: 15"));
        assert!(report.ends_with("Total time: 105.000ms"));
    }

    #[test]
    fn clear_drops_records() {
        let stats = ManagerStats::new();
        stats.record_call(Operation::Delete, "foo", Duration::from_millis(1), true);
        stats.clear_records();
        assert!(stats.report().records().is_empty());
        assert_eq!(stats.snapshot().deletes, 1);
    }
}
