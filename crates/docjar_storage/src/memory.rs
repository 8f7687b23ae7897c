//! In-memory row store with serializable transactions.

use crate::backend::Backend;
use crate::error::{StorageError, StorageResult};
use crate::filter::Filter;
use crate::row::{Document, ObjectId, Row, Version, VersionScheme, WriteOutcome};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct StoredRow {
    document: Document,
    version: Version,
}

type Table = BTreeMap<ObjectId, StoredRow>;

/// Shared committed state of an in-memory database.
///
/// Each [`InMemoryBackend`] obtained from [`InMemoryStore::connect`] is an
/// independent connection with its own transaction. Writes are buffered per
/// transaction and applied atomically on commit. Commit validates that every
/// written row still has the version the transaction based its write on, so
/// the first committer wins and later committers fail with
/// [`StorageError::SerializationFailure`].
///
/// Reads see the latest committed state overlaid with the connection's own
/// uncommitted writes.
///
/// # Example
///
/// ```rust
/// use docjar_storage::{Backend, InMemoryStore, ObjectId};
/// use serde_json::json;
///
/// let store = InMemoryStore::shared();
/// let mut conn = store.connect();
///
/// conn.begin().unwrap();
/// let doc = json!({"name": "foo"}).as_object().cloned().unwrap();
/// conn.insert_row("foo", &ObjectId::new("1"), doc).unwrap();
/// conn.commit().unwrap();
///
/// assert_eq!(store.row_count("foo"), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<HashMap<String, Table>>,
    scheme: VersionScheme,
    unavailable: AtomicBool,
    commits: AtomicU64,
}

impl InMemoryStore {
    /// Creates an empty store using counter versions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store using the given version scheme.
    #[must_use]
    pub fn with_scheme(scheme: VersionScheme) -> Self {
        Self {
            scheme,
            ..Self::default()
        }
    }

    /// Creates an empty shared store using counter versions.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Opens a new connection to this store.
    #[must_use]
    pub fn connect(self: &Arc<Self>) -> InMemoryBackend {
        InMemoryBackend {
            store: Arc::clone(self),
            txn: None,
        }
    }

    /// Returns the version scheme of this store.
    #[must_use]
    pub fn scheme(&self) -> VersionScheme {
        self.scheme
    }

    /// Reads a committed row outside of any transaction.
    #[must_use]
    pub fn row(&self, table: &str, id: &ObjectId) -> Option<Row> {
        self.tables
            .read()
            .get(table)
            .and_then(|t| t.get(id))
            .map(|stored| to_row(id, stored))
    }

    /// Returns every committed row of a table, ordered by key.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.iter().map(|(id, stored)| to_row(id, stored)).collect())
            .unwrap_or_default()
    }

    /// Returns the number of committed rows in a table.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    /// Returns the number of successful commits.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Simulates loss of connectivity: while set, every backend call fails
    /// with [`StorageError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn committed(&self, table: &str, id: &ObjectId) -> Option<StoredRow> {
        self.tables.read().get(table).and_then(|t| t.get(id)).cloned()
    }
}

fn to_row(id: &ObjectId, stored: &StoredRow) -> Row {
    Row {
        id: id.clone(),
        document: stored.document.clone(),
        version: stored.version.clone(),
    }
}

#[derive(Debug, Clone)]
enum Pending {
    Put {
        document: Document,
        version: Version,
        base: Option<Version>,
    },
    Delete {
        base: Option<Version>,
    },
}

impl Pending {
    fn base(&self) -> Option<&Version> {
        match self {
            Self::Put { base, .. } | Self::Delete { base } => base.as_ref(),
        }
    }
}

type WriteSet = BTreeMap<(String, ObjectId), Pending>;

#[derive(Debug, Default)]
struct OpenTxn {
    writes: WriteSet,
    savepoints: Vec<(String, WriteSet)>,
}

/// A connection to an [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemoryBackend {
    store: Arc<InMemoryStore>,
    txn: Option<OpenTxn>,
}

impl InMemoryBackend {
    /// Returns the store this connection talks to.
    #[must_use]
    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }

    fn txn(&self) -> StorageResult<&OpenTxn> {
        self.store.check_available()?;
        self.txn.as_ref().ok_or(StorageError::NoTransaction)
    }

    fn txn_mut(&mut self) -> StorageResult<&mut OpenTxn> {
        self.store.check_available()?;
        self.txn.as_mut().ok_or(StorageError::NoTransaction)
    }

    /// Row as seen by this transaction, plus the committed version any new
    /// write must be based on.
    fn visible(&self, table: &str, id: &ObjectId) -> StorageResult<(Option<StoredRow>, Option<Version>)> {
        let txn = self.txn()?;
        let key = (table.to_string(), id.clone());
        Ok(match txn.writes.get(&key) {
            Some(pending) => {
                let base = pending.base().cloned();
                let row = match pending {
                    Pending::Put {
                        document, version, ..
                    } => Some(StoredRow {
                        document: document.clone(),
                        version: version.clone(),
                    }),
                    Pending::Delete { .. } => None,
                };
                (row, base)
            }
            None => {
                let row = self.store.committed(table, id);
                let base = row.as_ref().map(|r| r.version.clone());
                (row, base)
            }
        })
    }

    fn stage(&mut self, table: &str, id: &ObjectId, pending: Pending) -> StorageResult<()> {
        self.txn_mut()?
            .writes
            .insert((table.to_string(), id.clone()), pending);
        Ok(())
    }
}

impl Backend for InMemoryBackend {
    fn begin(&mut self) -> StorageResult<()> {
        self.store.check_available()?;
        if self.txn.is_some() {
            return Err(StorageError::TransactionActive);
        }
        self.txn = Some(OpenTxn::default());
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        let txn = self.txn.take().ok_or(StorageError::NoTransaction)?;
        self.store.check_available()?;

        let mut tables = self.store.tables.write();

        for ((table, id), pending) in &txn.writes {
            let current = tables.get(table).and_then(|t| t.get(id)).map(|r| &r.version);
            if current != pending.base() {
                return Err(StorageError::serialization_failure(table, id.as_str()));
            }
        }

        for ((table, id), pending) in txn.writes {
            match pending {
                Pending::Put {
                    document, version, ..
                } => {
                    tables
                        .entry(table)
                        .or_default()
                        .insert(id, StoredRow { document, version });
                }
                Pending::Delete { .. } => {
                    if let Some(t) = tables.get_mut(&table) {
                        t.remove(&id);
                    }
                }
            }
        }

        self.store.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> StorageResult<()> {
        self.txn = None;
        self.store.check_available()
    }

    fn create_savepoint(&mut self, name: &str) -> StorageResult<()> {
        let txn = self.txn_mut()?;
        let snapshot = txn.writes.clone();
        txn.savepoints.push((name.to_string(), snapshot));
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> StorageResult<()> {
        let txn = self.txn_mut()?;
        let pos = txn
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| StorageError::UnknownSavepoint(name.to_string()))?;
        txn.savepoints.truncate(pos + 1);
        txn.writes = txn.savepoints[pos].1.clone();
        Ok(())
    }

    fn fetch_row(&mut self, table: &str, id: &ObjectId) -> StorageResult<Option<Row>> {
        let (row, _) = self.visible(table, id)?;
        Ok(row.map(|stored| to_row(id, &stored)))
    }

    fn insert_row(
        &mut self,
        table: &str,
        id: &ObjectId,
        document: Document,
    ) -> StorageResult<Version> {
        let (row, base) = self.visible(table, id)?;
        if row.is_some() {
            return Err(StorageError::unique_violation(table, id.as_str()));
        }

        let scheme = self.store.scheme;
        // A re-insert after a delete continues the old row's version line.
        let version = match &base {
            Some(previous) => scheme.next(previous, &document),
            None => scheme.initial(&document),
        };
        self.stage(
            table,
            id,
            Pending::Put {
                document,
                version: version.clone(),
                base,
            },
        )?;
        Ok(version)
    }

    fn update_row(
        &mut self,
        table: &str,
        id: &ObjectId,
        document: Document,
        expected: Option<&Version>,
    ) -> StorageResult<WriteOutcome<Version>> {
        let (row, base) = self.visible(table, id)?;
        let Some(row) = row else {
            return Ok(WriteOutcome::Conflict { current: None });
        };
        if expected.is_some_and(|e| *e != row.version) {
            return Ok(WriteOutcome::Conflict {
                current: Some(row.version),
            });
        }

        let version = self.store.scheme.next(&row.version, &document);
        self.stage(
            table,
            id,
            Pending::Put {
                document,
                version: version.clone(),
                base,
            },
        )?;
        Ok(WriteOutcome::Applied(version))
    }

    fn delete_row(
        &mut self,
        table: &str,
        id: &ObjectId,
        expected: Option<&Version>,
    ) -> StorageResult<WriteOutcome<()>> {
        let (row, base) = self.visible(table, id)?;
        let Some(row) = row else {
            return Ok(WriteOutcome::Conflict { current: None });
        };
        if expected.is_some_and(|e| *e != row.version) {
            return Ok(WriteOutcome::Conflict {
                current: Some(row.version),
            });
        }

        self.stage(table, id, Pending::Delete { base })?;
        Ok(WriteOutcome::Applied(()))
    }

    fn query(&mut self, table: &str, filter: &Filter) -> StorageResult<Vec<Row>> {
        let txn = self.txn()?;

        let mut merged: BTreeMap<ObjectId, StoredRow> =
            self.store.tables.read().get(table).cloned().unwrap_or_default();
        for ((t, id), pending) in &txn.writes {
            if t != table {
                continue;
            }
            match pending {
                Pending::Put {
                    document, version, ..
                } => {
                    merged.insert(
                        id.clone(),
                        StoredRow {
                            document: document.clone(),
                            version: version.clone(),
                        },
                    );
                }
                Pending::Delete { .. } => {
                    merged.remove(id);
                }
            }
        }

        Ok(merged
            .iter()
            .filter(|(_, stored)| filter.matches(&stored.document))
            .map(|(id, stored)| to_row(id, stored))
            .collect())
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn id(s: &str) -> ObjectId {
        ObjectId::new(s)
    }

    fn seeded() -> Arc<InMemoryStore> {
        let store = InMemoryStore::shared();
        let mut conn = store.connect();
        conn.begin().unwrap();
        conn.insert_row("foo", &id("1"), doc(json!({"name": "one"})))
            .unwrap();
        conn.commit().unwrap();
        store
    }

    #[test]
    fn operations_require_transaction() {
        let store = InMemoryStore::shared();
        let mut conn = store.connect();
        let result = conn.fetch_row("foo", &id("1"));
        assert_eq!(result, Err(StorageError::NoTransaction));
    }

    #[test]
    fn begin_twice_fails() {
        let store = InMemoryStore::shared();
        let mut conn = store.connect();
        conn.begin().unwrap();
        assert_eq!(conn.begin(), Err(StorageError::TransactionActive));
    }

    #[test]
    fn insert_and_fetch() {
        let store = seeded();
        let row = store.row("foo", &id("1")).unwrap();
        assert_eq!(row.document, doc(json!({"name": "one"})));
        assert_eq!(row.version, Version::counter(1));
    }

    #[test]
    fn uncommitted_writes_are_private() {
        let store = seeded();
        let mut a = store.connect();
        let mut b = store.connect();
        a.begin().unwrap();
        b.begin().unwrap();

        a.insert_row("foo", &id("2"), doc(json!({}))).unwrap();
        assert!(a.fetch_row("foo", &id("2")).unwrap().is_some());
        assert!(b.fetch_row("foo", &id("2")).unwrap().is_none());

        a.rollback().unwrap();
        assert_eq!(store.row_count("foo"), 1);
    }

    #[test]
    fn duplicate_insert_is_unique_violation() {
        let store = seeded();
        let mut conn = store.connect();
        conn.begin().unwrap();
        let result = conn.insert_row("foo", &id("1"), doc(json!({})));
        assert!(matches!(result, Err(StorageError::UniqueViolation { .. })));
    }

    #[test]
    fn update_checks_expected_version() {
        let store = seeded();
        let mut conn = store.connect();
        conn.begin().unwrap();

        let stale = Version::counter(7);
        let outcome = conn
            .update_row("foo", &id("1"), doc(json!({"name": "x"})), Some(&stale))
            .unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Conflict {
                current: Some(Version::counter(1))
            }
        );

        let outcome = conn
            .update_row(
                "foo",
                &id("1"),
                doc(json!({"name": "x"})),
                Some(&Version::counter(1)),
            )
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Applied(Version::counter(2)));
        conn.commit().unwrap();
        assert_eq!(
            store.row("foo", &id("1")).unwrap().version,
            Version::counter(2)
        );
    }

    #[test]
    fn update_missing_row_conflicts() {
        let store = InMemoryStore::shared();
        let mut conn = store.connect();
        conn.begin().unwrap();
        let outcome = conn
            .update_row("foo", &id("9"), doc(json!({})), None)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict { current: None });
    }

    #[test]
    fn first_committer_wins() {
        let store = seeded();
        let mut a = store.connect();
        let mut b = store.connect();
        a.begin().unwrap();
        b.begin().unwrap();

        a.update_row("foo", &id("1"), doc(json!({"name": "a"})), None)
            .unwrap();
        b.update_row("foo", &id("1"), doc(json!({"name": "b"})), None)
            .unwrap();

        a.commit().unwrap();
        let result = b.commit();
        assert!(matches!(
            result,
            Err(StorageError::SerializationFailure { .. })
        ));
        assert!(!b.in_transaction());
        assert_eq!(
            store.row("foo", &id("1")).unwrap().document,
            doc(json!({"name": "a"}))
        );
    }

    #[test]
    fn delete_then_reinsert_continues_versions() {
        let store = seeded();
        let mut conn = store.connect();
        conn.begin().unwrap();
        conn.delete_row("foo", &id("1"), Some(&Version::counter(1)))
            .unwrap();
        assert!(conn.fetch_row("foo", &id("1")).unwrap().is_none());
        let v = conn
            .insert_row("foo", &id("1"), doc(json!({"name": "again"})))
            .unwrap();
        assert_eq!(v, Version::counter(2));
        conn.commit().unwrap();
        assert_eq!(store.row_count("foo"), 1);
    }

    #[test]
    fn savepoints_restore_write_set() {
        let store = InMemoryStore::shared();
        let mut conn = store.connect();
        conn.begin().unwrap();
        conn.insert_row("foo", &id("1"), doc(json!({}))).unwrap();
        conn.create_savepoint("sp1").unwrap();
        conn.insert_row("foo", &id("2"), doc(json!({}))).unwrap();
        conn.create_savepoint("sp2").unwrap();
        conn.insert_row("foo", &id("3"), doc(json!({}))).unwrap();

        conn.rollback_to_savepoint("sp1").unwrap();
        assert!(conn.fetch_row("foo", &id("1")).unwrap().is_some());
        assert!(conn.fetch_row("foo", &id("2")).unwrap().is_none());
        assert_eq!(
            conn.rollback_to_savepoint("sp2"),
            Err(StorageError::UnknownSavepoint("sp2".into()))
        );

        conn.commit().unwrap();
        assert_eq!(store.row_count("foo"), 1);
    }

    #[test]
    fn query_merges_pending_writes() {
        let store = seeded();
        let mut conn = store.connect();
        conn.begin().unwrap();
        conn.insert_row("foo", &id("2"), doc(json!({"name": "two"})))
            .unwrap();
        conn.delete_row("foo", &id("1"), None).unwrap();

        let rows = conn.query("foo", &Filter::All).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id("2"));

        let rows = conn.query("foo", &Filter::eq("name", "one")).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn unavailable_store_fails_calls() {
        let store = seeded();
        let mut conn = store.connect();
        conn.begin().unwrap();
        store.set_unavailable(true);
        assert!(matches!(
            conn.fetch_row("foo", &id("1")),
            Err(StorageError::Unavailable(_))
        ));
        assert!(matches!(conn.commit(), Err(StorageError::Unavailable(_))));
        store.set_unavailable(false);
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn content_hash_versions() {
        let store = Arc::new(InMemoryStore::with_scheme(VersionScheme::ContentHash));
        let mut conn = store.connect();
        conn.begin().unwrap();
        let d = doc(json!({"name": "x"}));
        let v = conn.insert_row("foo", &id("1"), d.clone()).unwrap();
        assert_eq!(v, Version::digest_of(&d));
        conn.commit().unwrap();
    }
}
