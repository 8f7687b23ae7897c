//! Stress tests for docjar.
//!
//! These verify that optimistic concurrency loses no update when several
//! data managers write the same object from different threads.

use crate::fixtures::{TestStore, BAR, BAR_TABLE};
use docjar_core::{CoreError, CoreResult, DataManager, StorageError, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Id of the shared counter object.
pub const COUNTER_ID: &str = "counter";

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Committed transactions.
    pub successful_ops: usize,
    /// Transactions that gave up after too many retries.
    pub failed_ops: usize,
    /// Attempts that failed with a retryable error.
    pub retries: usize,
    /// Total duration.
    pub duration: Duration,
    /// Committed transactions per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, retries: usize, duration: Duration) -> Self {
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            successful as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            successful_ops: successful,
            failed_ops: failed,
            retries,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {name} ===");
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Retries: {}", self.retries);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent threads.
    pub threads: usize,
    /// Increments performed by each thread.
    pub increments: usize,
    /// Attempts per increment before giving up.
    pub max_attempts: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            increments: 50,
            max_attempts: 1_000,
        }
    }
}

/// Returns true for errors a client should answer by retrying the whole
/// transaction: flush-time conflicts and commit-time serialization
/// failures.
pub fn should_retry(error: &CoreError) -> bool {
    error.is_retryable()
        || matches!(
            error,
            CoreError::Backend(StorageError::SerializationFailure { .. })
        )
}

/// Increments the shared counter in one transaction.
pub fn increment(dm: &mut DataManager) -> CoreResult<i64> {
    dm.transaction(|dm| {
        let counter = dm
            .get(BAR_TABLE, COUNTER_ID)?
            .ok_or_else(|| CoreError::invalid_operation("counter missing"))?;
        let next = dm
            .get_attr(&counter, "n")?
            .and_then(|v| v.as_int())
            .unwrap_or(0)
            + 1;
        dm.set_attr(&counter, "n", next)?;
        Ok(next)
    })
}

/// Runs concurrent increments of one counter object, retrying on
/// conflicts.
pub fn stress_concurrent_increments(store: &TestStore, config: &StressConfig) -> StressTestResult {
    store.seed(BAR, COUNTER_ID, &[("n", Value::Int(0))]);

    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let retries = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let mut dm = store.dm();
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let retries = Arc::clone(&retries);
            let config = config.clone();

            thread::spawn(move || {
                for _ in 0..config.increments {
                    let mut committed = false;
                    for _ in 0..config.max_attempts {
                        match increment(&mut dm) {
                            Ok(_) => {
                                committed = true;
                                break;
                            }
                            Err(e) if should_retry(&e) => {
                                debug!(error = %e, "retrying increment");
                                retries.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                    if committed {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        retries.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Reads the committed counter value.
pub fn counter_value(store: &TestStore) -> Option<i64> {
    let row = store
        .store
        .row(BAR_TABLE, &docjar_core::ObjectId::new(COUNTER_ID))?;
    row.document.get("n").and_then(serde_json::Value::as_i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_single_manager() {
        let store = TestStore::new();
        store.seed(BAR, COUNTER_ID, &[("n", Value::Int(0))]);
        let mut dm = store.dm();
        assert_eq!(increment(&mut dm).unwrap(), 1);
        assert_eq!(increment(&mut dm).unwrap(), 2);
        assert_eq!(counter_value(&store), Some(2));
    }

    #[test]
    fn test_concurrent_increments_lose_nothing() {
        let store = TestStore::new();
        let config = StressConfig {
            threads: 4,
            increments: 25,
            ..StressConfig::default()
        };
        let result = stress_concurrent_increments(&store, &config);
        result.print_summary("concurrent increments");

        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 100);
        assert_eq!(counter_value(&store), Some(100));
    }

    #[test]
    fn test_should_retry() {
        assert!(should_retry(&CoreError::from(
            StorageError::serialization_failure("bar", "counter")
        )));
        assert!(!should_retry(&CoreError::from(StorageError::Unavailable(
            "down".into()
        ))));
    }
}
