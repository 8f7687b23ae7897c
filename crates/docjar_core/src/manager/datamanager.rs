//! The data manager.

use crate::cache::IdentityCache;
use crate::codec::{Codec, TypeRegistry};
use crate::config::{CacheScope, Config, ResolveMode};
use crate::conflict::ConflictDetector;
use crate::error::{CoreError, CoreResult};
use crate::manager::state::{Savepoint, SavepointFrame, TransactionState, TxnStatus};
use crate::object::{HandleKey, ObjectHandle, Value};
use crate::reference::ReferenceResolver;
use crate::stats::{ManagerStats, Operation, QueryReport, StatsSnapshot};
use crate::types::{ObjectRef, TransactionId};
use docjar_storage::{Backend, Document, Filter, ObjectId, Row, StorageResult, Version, WriteOutcome};
use indexmap::IndexMap;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// A write planned by a flush.
struct PlannedWrite {
    handle: ObjectHandle,
    reference: ObjectRef,
    document: Document,
}

/// Coordinates persistent objects with one backend connection.
///
/// A data manager owns the identity cache, the set of objects registered
/// for writing and the conflict detector of its current transaction. It
/// participates in a transaction through a two-phase protocol:
/// [`tpc_begin`](Self::tpc_begin), [`tpc_vote`](Self::tpc_vote) (which
/// flushes every pending change) and [`tpc_finish`](Self::tpc_finish)
/// (which commits the backend transaction). [`commit`](Self::commit) runs
/// all three.
///
/// Errors raised once work has started, such as backend failures, decode
/// errors or conflicts, abort the transaction before they are returned.
/// Calls refused up front (a removed object, an unknown savepoint, a
/// transaction that is not active) leave the transaction unchanged.
///
/// A finished transaction is followed by a new one with
/// [`reset`](Self::reset), or use [`transaction`](Self::transaction).
///
/// # Example
///
/// ```rust,ignore
/// let mut dm = DataManager::new(store.connect(), registry, Config::default());
/// let person = ObjectHandle::new("Person").with("name", "stephan");
/// let reference = dm.insert(&person, None)?;
/// dm.commit()?;
/// ```
pub struct DataManager {
    backend: Box<dyn Backend>,
    backend_open: bool,
    registry: Arc<TypeRegistry>,
    config: Config,
    txn_id: TransactionId,
    status: TxnStatus,
    state: TransactionState,
    cache: IdentityCache,
    detector: ConflictDetector,
    savepoints: Vec<SavepointFrame>,
    next_savepoint: u64,
    stats: ManagerStats,
}

impl DataManager {
    /// Creates a data manager with an active transaction.
    ///
    /// The backend transaction is started lazily by the first call that
    /// needs it.
    pub fn new(backend: impl Backend + 'static, registry: Arc<TypeRegistry>, config: Config) -> Self {
        let txn_id = TransactionId::new(1);
        debug!(txn = %txn_id, "transaction started");
        Self {
            backend: Box::new(backend),
            backend_open: false,
            registry,
            config,
            txn_id,
            status: TxnStatus::Active,
            state: TransactionState::default(),
            cache: IdentityCache::new(),
            detector: ConflictDetector::new(),
            savepoints: Vec::new(),
            next_savepoint: 0,
            stats: ManagerStats::new(),
        }
    }

    // === Accessors ===

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the type registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Returns the status of the current transaction.
    #[must_use]
    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// Returns the id of the current transaction.
    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        self.txn_id
    }

    /// Returns the number of handles in the identity cache.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Returns true if the object is registered for the next flush.
    #[must_use]
    pub fn is_registered(&self, handle: &ObjectHandle) -> bool {
        self.state.is_registered(handle)
    }

    /// Returns the number of objects waiting for the next flush.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.pending_count()
    }

    /// Returns a snapshot of the statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the timed backend calls recorded so far.
    #[must_use]
    pub fn query_report(&self) -> QueryReport {
        self.stats.report()
    }

    /// Drops the timed backend calls recorded so far.
    pub fn clear_query_report(&self) {
        self.stats.clear_records();
    }

    // === Reading ===

    /// Returns the object stored under `(table, id)`, or `None` if there is
    /// no such row or it was removed in this transaction.
    ///
    /// Repeated calls return the same handle.
    ///
    /// # Errors
    ///
    /// Fails if the backend fails or the stored document does not decode.
    pub fn get(&mut self, table: &str, id: impl Into<ObjectId>) -> CoreResult<Option<ObjectHandle>> {
        self.ensure_active("get")?;
        let reference = ObjectRef::new(table, id);
        let result = self.get_inner(&reference);
        self.guard(result)
    }

    fn get_inner(&mut self, reference: &ObjectRef) -> CoreResult<Option<ObjectHandle>> {
        let handle = match self.cache.get(reference) {
            Some(handle) => handle,
            None => {
                let Some(row) = self.fetch(reference)? else {
                    return Ok(None);
                };
                let handle = self.hollow_handle(reference)?;
                self.refresh(&handle, reference, row)?;
                handle
            }
        };
        if handle.is_removed() {
            return Ok(None);
        }
        match self.activate_inner(&handle) {
            Ok(()) => {}
            Err(CoreError::ObjectNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        }
        if self.config.resolve_mode == ResolveMode::Eager {
            self.resolve_graph(&handle)?;
        }
        Ok(Some(handle))
    }

    /// Returns a handle for a reference without touching the backend.
    ///
    /// The handle is hollow unless the object is already cached.
    ///
    /// # Errors
    ///
    /// Fails if no registered class is stored in the reference's table.
    pub fn load(&mut self, reference: &ObjectRef) -> CoreResult<ObjectHandle> {
        self.ensure_active("load")?;
        match self.cache.get(reference) {
            Some(handle) => Ok(handle),
            None => self.hollow_handle(reference),
        }
    }

    /// Loads a hollow handle, or revalidates a cached handle left over from
    /// an earlier transaction. Transient handles are always loaded.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ObjectNotFound`] if the row is gone.
    pub fn activate(&mut self, handle: &ObjectHandle) -> CoreResult<()> {
        self.ensure_active("activate")?;
        let result = self.activate_inner(handle);
        self.guard(result)
    }

    /// Reads an attribute, loading the object first if needed.
    ///
    /// # Errors
    ///
    /// Fails like [`activate`](Self::activate).
    pub fn get_attr(&mut self, handle: &ObjectHandle, name: &str) -> CoreResult<Option<Value>> {
        self.activate(handle)?;
        handle.get(name)
    }

    /// Writes an attribute and registers the object for the next flush.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UseAfterRemove`] if the object was removed, or
    /// fails like [`activate`](Self::activate).
    pub fn set_attr(
        &mut self,
        handle: &ObjectHandle,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        self.ensure_active("modify")?;
        if handle.is_removed() {
            return Err(CoreError::UseAfterRemove {
                object: handle.describe(),
            });
        }
        self.activate(handle)?;
        handle.set(name, value)?;
        self.register(handle)
    }

    /// Deletes an attribute and registers the object for the next flush.
    ///
    /// # Errors
    ///
    /// Fails like [`set_attr`](Self::set_attr).
    pub fn del_attr(&mut self, handle: &ObjectHandle, name: &str) -> CoreResult<Option<Value>> {
        self.ensure_active("modify")?;
        if handle.is_removed() {
            return Err(CoreError::UseAfterRemove {
                object: handle.describe(),
            });
        }
        self.activate(handle)?;
        let old = handle.unset(name)?;
        self.register(handle)?;
        Ok(old)
    }

    /// Returns every object of `table` whose document matches `filter`,
    /// ordered by id.
    ///
    /// Pending changes are flushed first unless
    /// [`Config::flush_before_query`] is off. Objects already cached are
    /// returned as the cached handle.
    ///
    /// # Errors
    ///
    /// Fails if the flush or the backend query fails, or a row does not
    /// decode.
    pub fn find(&mut self, table: &str, filter: &Filter) -> CoreResult<Vec<ObjectHandle>> {
        self.ensure_active("find")?;
        if self.config.flush_before_query {
            self.flush()?;
        }
        let result = self.find_inner(table, filter);
        self.guard(result)
    }

    /// Returns the first object matching `filter`.
    ///
    /// # Errors
    ///
    /// Fails like [`find`](Self::find).
    pub fn find_one(&mut self, table: &str, filter: &Filter) -> CoreResult<Option<ObjectHandle>> {
        Ok(self.find(table, filter)?.into_iter().next())
    }

    fn find_inner(&mut self, table: &str, filter: &Filter) -> CoreResult<Vec<ObjectHandle>> {
        let rows = self.call(Operation::Query, table, |b| b.query(table, filter))?;
        let mut found = Vec::with_capacity(rows.len());
        for row in rows {
            let reference = ObjectRef::new(table, row.id.clone());
            let handle = match self.cache.get(&reference) {
                Some(handle) => handle,
                None => self.hollow_handle(&reference)?,
            };
            if handle.is_removed() {
                continue;
            }
            if handle.is_hollow() || !self.cache.is_current(&reference) {
                self.refresh(&handle, &reference, row)?;
            }
            found.push(handle);
        }
        if self.config.resolve_mode == ResolveMode::Eager {
            for handle in &found {
                self.resolve_graph(handle)?;
            }
        }
        Ok(found)
    }

    /// Loads every object reachable from `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CircularReference`] if the graph has a cycle.
    pub fn resolve_eager(&mut self, handle: &ObjectHandle) -> CoreResult<()> {
        self.ensure_active("resolve")?;
        let result = self.resolve_graph(handle);
        self.guard(result)
    }

    /// Depth-first walk with an explicit stack. A handle met again while it
    /// is still on the path closes a cycle.
    fn resolve_graph(&mut self, root: &ObjectHandle) -> CoreResult<()> {
        struct Frame {
            handle: ObjectHandle,
            children: std::vec::IntoIter<ObjectHandle>,
        }

        let mut done: HashSet<HandleKey> = HashSet::new();
        let mut path: Vec<HandleKey> = Vec::new();
        let mut stack: Vec<Frame> = Vec::new();

        self.activate_inner(root)?;
        path.push(root.key());
        stack.push(Frame {
            handle: root.clone(),
            children: root.references()?.into_iter(),
        });

        while let Some(frame) = stack.last_mut() {
            let Some(child) = frame.children.next() else {
                let finished = frame.handle.key();
                stack.pop();
                path.pop();
                done.insert(finished);
                continue;
            };
            let key = child.key();
            if done.contains(&key) {
                continue;
            }
            if let Some(start) = path.iter().position(|k| *k == key) {
                let mut cycle: Vec<String> = stack[start..]
                    .iter()
                    .map(|f| f.handle.describe())
                    .collect();
                cycle.push(child.describe());
                return Err(CoreError::CircularReference { cycle });
            }
            self.activate_inner(&child)?;
            let children = child.references()?.into_iter();
            path.push(key);
            stack.push(Frame {
                handle: child,
                children,
            });
        }
        Ok(())
    }

    // === Registration ===

    /// Registers a new or modified object for the next flush.
    ///
    /// Registering twice is a no-op, and so is registering a removed
    /// object.
    ///
    /// # Errors
    ///
    /// Fails if a different handle for the same object is already cached.
    pub fn register(&mut self, handle: &ObjectHandle) -> CoreResult<()> {
        self.ensure_active("register")?;
        if handle.is_removed() {
            return Ok(());
        }
        if let Some(reference) = handle.object_ref() {
            let canonical = self.cache.put(reference.clone(), handle.clone());
            if !canonical.ptr_eq(handle) {
                return Err(CoreError::invalid_operation(format!(
                    "another handle for {reference} is live in this transaction"
                )));
            }
        }
        if self.state.register(handle) {
            trace!(txn = %self.txn_id, object = %handle.describe(), "registered");
        }
        Ok(())
    }

    /// Gives a new object an id and registers it for insertion.
    ///
    /// Without `id` a random one is generated.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyPersisted`] if the object already has an
    /// id or the id is taken in this transaction, and
    /// [`CoreError::InvalidOperation`] if its class is not registered.
    pub fn insert(&mut self, handle: &ObjectHandle, id: Option<ObjectId>) -> CoreResult<ObjectRef> {
        self.ensure_active("insert")?;
        if let Some(reference) = handle.object_ref() {
            return Err(CoreError::AlreadyPersisted { object: reference });
        }
        let class = handle.class();
        let table = self
            .registry
            .table_of(&class)
            .ok_or_else(|| CoreError::invalid_operation(format!("class {class} is not registered")))?;
        let reference = ObjectRef::new(table, id.unwrap_or_else(ObjectId::generate));
        if self.cache.contains(&reference) {
            return Err(CoreError::AlreadyPersisted { object: reference });
        }
        self.adopt_new(handle, &reference);
        Ok(reference)
    }

    /// Removes a persistent object.
    ///
    /// Removing an object inserted in this transaction and not yet flushed
    /// cancels the insert. Removing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotPersisted`] for a transient object, or fails
    /// like [`activate`](Self::activate).
    pub fn remove(&mut self, handle: &ObjectHandle) -> CoreResult<()> {
        self.ensure_active("remove")?;
        let Some(reference) = handle.object_ref() else {
            return Err(CoreError::NotPersisted {
                class: handle.class(),
            });
        };
        if handle.is_removed() {
            return Ok(());
        }

        if self.state.was_assigned(handle) && handle.version().is_none() {
            self.state.unregister(handle);
            self.state.forget_assigned(handle);
            self.cache.evict(&reference);
            self.detector.forget(&reference);
            handle.strip_id();
            debug!(txn = %self.txn_id, object = %reference, "cancelled pending insert");
            return Ok(());
        }

        let result = self.activate_inner(handle);
        self.guard(result)?;
        handle.set_removed(true);
        self.state.remove(handle);
        trace!(txn = %self.txn_id, object = %reference, "removed");
        Ok(())
    }

    // === Flushing ===

    /// Writes every pending change to the backend transaction.
    ///
    /// # Errors
    ///
    /// Fails on encode errors, conflicts and backend errors. The
    /// transaction is aborted before the error is returned.
    pub fn flush(&mut self) -> CoreResult<()> {
        self.ensure_active("flush")?;
        let result = self.flush_inner();
        self.guard(result)
    }

    fn flush_inner(&mut self) -> CoreResult<()> {
        let registry = Arc::clone(&self.registry);
        let codec = Codec::new(&registry);
        let cascade = self.config.cascade_inserts;

        let mut queue: VecDeque<ObjectHandle> = self.state.registered().cloned().collect();
        queue.extend(
            self.cache
                .handles()
                .filter(|h| h.is_dirty() && !h.is_hollow())
                .cloned(),
        );

        let mut seen = HashSet::new();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();

        while let Some(handle) = queue.pop_front() {
            if !seen.insert(handle.key()) || handle.is_removed() || handle.is_hollow() {
                continue;
            }
            let reference = match handle.object_ref() {
                Some(reference) => reference,
                None => {
                    let class = handle.class();
                    let table = registry.table_of(&class).ok_or_else(|| {
                        CoreError::invalid_operation(format!("class {class} is not registered"))
                    })?;
                    let reference = ObjectRef::new(table, ObjectId::generate());
                    self.adopt_new(&handle, &reference);
                    reference
                }
            };

            let (encoded, discovered) = {
                let mut resolver = ReferenceResolver::new(&registry, &mut self.cache, cascade);
                let encoded = codec.encode(&handle, &mut resolver);
                (encoded, resolver.take_discovered())
            };
            // Ids handed out before a failed encode must still be stripped
            // on abort, so adopt them before propagating the error.
            for found in discovered {
                if let Some(found_ref) = found.object_ref() {
                    self.adopt_new(&found, &found_ref);
                }
                queue.push_back(found);
            }
            let document = encoded?;

            let write = PlannedWrite {
                handle,
                reference,
                document,
            };
            if write.handle.version().is_none() {
                inserts.push(write);
            } else if self.config.skip_unchanged_writes
                && write.handle.stored_document().as_ref() == Some(&write.document)
            {
                write.handle.mark_clean();
                self.stats.record_skipped_write();
                trace!(txn = %self.txn_id, object = %write.reference, "unchanged, not written");
            } else {
                self.state.touch(&write.handle);
                updates.push(write);
            }
        }

        let removals: Vec<(ObjectHandle, ObjectRef)> = self
            .state
            .removed()
            .filter_map(|h| h.object_ref().map(|r| (h.clone(), r)))
            .collect();

        if self.config.conflict_detection {
            for write in &updates {
                self.check_conflict(&write.reference)?;
            }
            for (_, reference) in &removals {
                self.check_conflict(reference)?;
            }
        }

        let mut written: Vec<(ObjectHandle, ObjectRef, Version, Document)> =
            Vec::with_capacity(inserts.len() + updates.len());

        for write in &inserts {
            let table = write.reference.table.as_str();
            let version = self.call(Operation::Insert, table, |b| {
                b.insert_row(table, &write.reference.id, write.document.clone())
            })?;
            written.push((
                write.handle.clone(),
                write.reference.clone(),
                version,
                write.document.clone(),
            ));
        }

        for write in &updates {
            let table = write.reference.table.as_str();
            let observed = write.handle.version();
            let expected = if self.config.conflict_detection {
                observed.clone()
            } else {
                None
            };
            let outcome = self.call(Operation::Update, table, |b| {
                b.update_row(table, &write.reference.id, write.document.clone(), expected.as_ref())
            })?;
            match outcome {
                WriteOutcome::Applied(version) => written.push((
                    write.handle.clone(),
                    write.reference.clone(),
                    version,
                    write.document.clone(),
                )),
                WriteOutcome::Conflict { current } => {
                    return Err(self.conflict(write.reference.clone(), observed, current));
                }
            }
        }

        for (handle, reference) in &removals {
            let table = reference.table.as_str();
            let observed = handle.version();
            let expected = if self.config.conflict_detection {
                observed.clone()
            } else {
                None
            };
            let outcome = self.call(Operation::Delete, table, |b| {
                b.delete_row(table, &reference.id, expected.as_ref())
            })?;
            if let WriteOutcome::Conflict { current } = outcome {
                return Err(self.conflict(reference.clone(), observed, current));
            }
        }

        for (handle, reference, version, document) in written {
            match registry.hooks(&handle.class()) {
                Some(hooks) => {
                    handle.mark_written(version.clone(), document.clone());
                    hooks.after_store(&handle, &document);
                }
                None => handle.mark_written(version.clone(), document),
            }
            self.detector.record_write(reference, version);
        }
        for (_, reference) in &removals {
            self.cache.evict(reference);
            self.detector.forget(reference);
        }
        self.state.clear_pending();

        debug!(
            txn = %self.txn_id,
            inserts = inserts.len(),
            updates = updates.len(),
            deletes = removals.len(),
            "flushed"
        );
        Ok(())
    }

    fn check_conflict(&mut self, reference: &ObjectRef) -> CoreResult<()> {
        let current = self.fetch(reference)?.map(|row| row.version);
        if let Err(conflict) = self.detector.check_at_commit(reference, current.as_ref()) {
            return Err(self.conflict(conflict.object, conflict.observed, conflict.current));
        }
        Ok(())
    }

    fn conflict(
        &self,
        object: ObjectRef,
        observed: Option<Version>,
        current: Option<Version>,
    ) -> CoreError {
        self.stats.record_conflict();
        warn!(txn = %self.txn_id, object = %object, "write conflict");
        CoreError::Conflict {
            object,
            observed,
            current,
        }
    }

    // === Two-phase commit ===

    /// Joins the transaction and opens the backend transaction.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active or the backend fails.
    pub fn tpc_begin(&mut self) -> CoreResult<()> {
        self.ensure_active("begin")?;
        let result = self.open_backend();
        self.guard(result)
    }

    /// Flushes every pending change. After a successful vote only
    /// [`tpc_finish`](Self::tpc_finish) or [`tpc_abort`](Self::tpc_abort)
    /// may follow.
    ///
    /// # Errors
    ///
    /// Fails like [`flush`](Self::flush); the transaction is aborted.
    pub fn tpc_vote(&mut self) -> CoreResult<()> {
        self.ensure_active("vote")?;
        self.status = TxnStatus::Voting;
        debug!(txn = %self.txn_id, "voting");
        let result = self.flush_inner();
        self.guard(result)
    }

    /// Commits the backend transaction.
    ///
    /// # Errors
    ///
    /// Fails if the vote did not happen, or with the backend's error, in
    /// which case the transaction is aborted.
    pub fn tpc_finish(&mut self) -> CoreResult<()> {
        if self.status != TxnStatus::Voting {
            return Err(CoreError::invalid_state(self.status, "finish"));
        }
        self.status = TxnStatus::Committing;
        if self.backend_open {
            self.backend_open = false;
            if let Err(e) = self.backend.commit() {
                warn!(txn = %self.txn_id, error = %e, "backend commit failed");
                self.abort_inner();
                return Err(e.into());
            }
        }
        self.state = TransactionState::default();
        self.detector.clear();
        self.savepoints.clear();
        self.status = TxnStatus::Committed;
        self.stats.record_commit();
        debug!(txn = %self.txn_id, "committed");
        Ok(())
    }

    /// Aborts the transaction; same as [`abort`](Self::abort).
    ///
    /// # Errors
    ///
    /// Fails like [`abort`](Self::abort).
    pub fn tpc_abort(&mut self) -> CoreResult<()> {
        self.abort()
    }

    /// Commits the transaction: begin, vote and finish.
    ///
    /// # Errors
    ///
    /// Fails like [`tpc_vote`](Self::tpc_vote) and
    /// [`tpc_finish`](Self::tpc_finish).
    pub fn commit(&mut self) -> CoreResult<()> {
        self.tpc_begin()?;
        self.tpc_vote()?;
        self.tpc_finish()
    }

    /// Rolls the transaction back.
    ///
    /// Objects inserted in this transaction become transient again and
    /// removals are undone. Aborting an aborted transaction is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidState`] if the transaction committed.
    pub fn abort(&mut self) -> CoreResult<()> {
        match self.status {
            TxnStatus::Committed => Err(CoreError::invalid_state(self.status, "abort")),
            TxnStatus::Aborted => Ok(()),
            _ => {
                self.abort_inner();
                Ok(())
            }
        }
    }

    fn abort_inner(&mut self) {
        self.status = TxnStatus::Aborting;
        if self.backend_open {
            self.backend_open = false;
            if let Err(e) = self.backend.rollback() {
                warn!(txn = %self.txn_id, error = %e, "backend rollback failed");
            }
        }

        let mut stale: Vec<ObjectRef> = Vec::new();
        if self.config.cache_scope == CacheScope::Manager {
            stale.extend(self.state.touched().filter_map(ObjectHandle::object_ref));
            stale.extend(
                self.cache
                    .handles()
                    .filter(|h| h.is_dirty())
                    .filter_map(ObjectHandle::object_ref),
            );
        }

        for handle in self.state.touched() {
            handle.set_removed(false);
        }
        for handle in self.state.assigned() {
            handle.strip_id();
        }

        match self.config.cache_scope {
            CacheScope::Transaction => self.cache.clear(),
            CacheScope::Manager => {
                for reference in &stale {
                    self.cache.evict(reference);
                }
            }
        }

        self.state = TransactionState::default();
        self.detector.clear();
        self.savepoints.clear();
        self.status = TxnStatus::Aborted;
        self.stats.record_abort();
        debug!(txn = %self.txn_id, "aborted");
    }

    /// Starts the next transaction after a commit or abort.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidState`] if the current transaction has
    /// not finished.
    pub fn reset(&mut self) -> CoreResult<()> {
        if !self.status.is_terminal() {
            return Err(CoreError::invalid_state(self.status, "reset"));
        }
        self.txn_id = self.txn_id.next();
        self.status = TxnStatus::Active;
        self.state = TransactionState::default();
        self.detector.clear();
        self.savepoints.clear();
        match self.config.cache_scope {
            CacheScope::Transaction => self.cache.clear(),
            CacheScope::Manager => {
                self.cache.begin_generation();
                let dropped = self.cache.prune(self.config.cache_capacity);
                if dropped > 0 {
                    trace!(txn = %self.txn_id, dropped, "pruned identity cache");
                }
            }
        }
        debug!(txn = %self.txn_id, "transaction started");
        Ok(())
    }

    /// Runs `f` in a transaction.
    ///
    /// A finished transaction is reset first. The transaction commits if
    /// `f` returns `Ok` and aborts otherwise.
    ///
    /// # Errors
    ///
    /// Returns the error of `f` or of the commit.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let reference = dm.transaction(|dm| {
    ///     let foo = ObjectHandle::new("Foo").with("name", "foo");
    ///     dm.insert(&foo, None)
    /// })?;
    /// ```
    pub fn transaction<F, T>(&mut self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Self) -> CoreResult<T>,
    {
        if self.status.is_terminal() {
            self.reset()?;
        }
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if !self.status.is_terminal() {
                    self.abort()?;
                }
                Err(e)
            }
        }
    }

    // === Savepoints ===

    /// Creates a savepoint.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active or the backend fails.
    pub fn savepoint(&mut self, name: impl Into<String>) -> CoreResult<Savepoint> {
        self.ensure_active("savepoint")?;
        let name = name.into();
        let result = self.savepoint_inner(name);
        self.guard(result)
    }

    fn savepoint_inner(&mut self, name: String) -> CoreResult<Savepoint> {
        self.next_savepoint += 1;
        let id = self.next_savepoint;
        let backend_name = format!("sp_{id}");
        self.call(Operation::Savepoint, &name, |b| b.create_savepoint(&backend_name))?;

        let mut objects: IndexMap<HandleKey, _> = IndexMap::new();
        for handle in self.cache.handles().chain(self.state.handles()) {
            objects
                .entry(handle.key())
                .or_insert_with(|| (handle.clone(), handle.snapshot()));
        }
        self.savepoints.push(SavepointFrame {
            id,
            backend_name,
            state: self.state.clone(),
            cache: self.cache.clone(),
            detector: self.detector.clone(),
            objects: objects.into_values().collect(),
        });

        debug!(txn = %self.txn_id, savepoint = %name, "savepoint created");
        Ok(Savepoint {
            id,
            name,
            txn: self.txn_id,
        })
    }

    /// Returns to a savepoint: every change made after it is undone, in the
    /// backend and in memory. Later savepoints are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownSavepoint`] if the savepoint was
    /// discarded or belongs to another transaction.
    pub fn rollback_to(&mut self, savepoint: &Savepoint) -> CoreResult<()> {
        self.ensure_active("roll back to savepoint")?;
        let Some(pos) = self
            .savepoints
            .iter()
            .position(|f| f.id == savepoint.id && savepoint.txn == self.txn_id)
        else {
            return Err(CoreError::unknown_savepoint(&savepoint.name));
        };
        let result = self.rollback_inner(pos, &savepoint.name);
        self.guard(result)
    }

    fn rollback_inner(&mut self, pos: usize, name: &str) -> CoreResult<()> {
        let backend_name = self.savepoints[pos].backend_name.clone();
        self.call(Operation::Savepoint, name, |b| b.rollback_to_savepoint(&backend_name))?;

        let frame = &self.savepoints[pos];
        let kept: HashSet<HandleKey> = frame.objects.iter().map(|(h, _)| h.key()).collect();
        let later: Vec<ObjectHandle> = self
            .state
            .assigned()
            .filter(|h| !frame.state.was_assigned(h))
            .cloned()
            .collect();

        for (handle, snapshot) in &frame.objects {
            handle.restore(snapshot.clone());
        }
        for handle in later {
            if !kept.contains(&handle.key()) {
                handle.strip_id();
            }
        }
        self.state = frame.state.clone();
        self.cache = frame.cache.clone();
        self.detector = frame.detector.clone();
        self.savepoints.truncate(pos + 1);

        debug!(txn = %self.txn_id, savepoint = %name, "rolled back to savepoint");
        Ok(())
    }

    // === Internals ===

    fn ensure_active(&self, operation: &'static str) -> CoreResult<()> {
        if self.status == TxnStatus::Active {
            Ok(())
        } else {
            Err(CoreError::invalid_state(self.status, operation))
        }
    }

    /// Aborts the transaction if `result` is an error.
    fn guard<T>(&mut self, result: CoreResult<T>) -> CoreResult<T> {
        if let Err(e) = &result {
            if !self.status.is_terminal() {
                debug!(txn = %self.txn_id, error = %e, "aborting after error");
                self.abort_inner();
            }
        }
        result
    }

    fn open_backend(&mut self) -> CoreResult<()> {
        if !self.backend_open {
            self.backend.begin()?;
            self.backend_open = true;
            trace!(txn = %self.txn_id, "backend transaction opened");
        }
        Ok(())
    }

    /// Runs a timed backend call.
    fn call<T>(
        &mut self,
        operation: Operation,
        table: &str,
        f: impl FnOnce(&mut dyn Backend) -> StorageResult<T>,
    ) -> CoreResult<T> {
        self.open_backend()?;
        let started = Instant::now();
        let result = f(self.backend.as_mut());
        let elapsed = started.elapsed();
        self.stats
            .record_call(operation, table, elapsed, self.config.record_queries);
        trace!(
            txn = %self.txn_id,
            op = operation.as_str(),
            table,
            ?elapsed,
            ok = result.is_ok(),
            "backend call"
        );
        Ok(result?)
    }

    fn fetch(&mut self, reference: &ObjectRef) -> CoreResult<Option<Row>> {
        self.call(Operation::Fetch, &reference.table, |b| {
            b.fetch_row(&reference.table, &reference.id)
        })
    }

    /// Caches and returns a hollow handle of the table's base class.
    fn hollow_handle(&mut self, reference: &ObjectRef) -> CoreResult<ObjectHandle> {
        let class = self.registry.base_class(&reference.table).ok_or_else(|| {
            CoreError::schema_mismatch(format!(
                "table {} stores no registered class",
                reference.table
            ))
        })?;
        let handle = ObjectHandle::hollow(class, reference);
        Ok(self.cache.put(reference.clone(), handle))
    }

    /// Gives a transient object its reference and schedules its insert.
    fn adopt_new(&mut self, handle: &ObjectHandle, reference: &ObjectRef) {
        handle.assign(reference);
        self.cache.put(reference.clone(), handle.clone());
        self.state.note_assigned(handle);
        self.state.register(handle);
        self.detector.record_load(reference.clone(), None);
        trace!(txn = %self.txn_id, object = %reference, "assigned id");
    }

    fn activate_inner(&mut self, handle: &ObjectHandle) -> CoreResult<()> {
        let Some(reference) = handle.object_ref() else {
            return Ok(());
        };
        if handle.is_removed() {
            return Ok(());
        }
        let current = self.cache.is_current(&reference);
        match self.cache.get(&reference) {
            Some(cached) if !cached.ptr_eq(handle) => {
                return Err(CoreError::invalid_operation(format!(
                    "another handle for {reference} is live in this transaction"
                )));
            }
            Some(_) => {}
            None => {
                self.cache.put(reference.clone(), handle.clone());
            }
        }
        if current && !handle.is_hollow() {
            return Ok(());
        }

        match self.fetch(&reference)? {
            Some(row) => self.refresh(handle, &reference, row),
            None => {
                self.cache.evict(&reference);
                self.detector.forget(&reference);
                Err(CoreError::ObjectNotFound { object: reference })
            }
        }
    }

    /// Brings a handle up to date with a stored row.
    fn refresh(&mut self, handle: &ObjectHandle, reference: &ObjectRef, row: Row) -> CoreResult<()> {
        let unchanged = !handle.is_hollow() && handle.version().as_ref() == Some(&row.version);
        if !unchanged {
            let registry = Arc::clone(&self.registry);
            let target = registry.base_class(&reference.table).ok_or_else(|| {
                CoreError::schema_mismatch(format!(
                    "table {} stores no registered class",
                    reference.table
                ))
            })?;
            let decoded = {
                let mut resolver =
                    ReferenceResolver::new(&registry, &mut self.cache, self.config.cascade_inserts);
                Codec::new(&registry).decode(&row.document, target, &mut resolver)?
            };
            let hooks = registry.hooks(&decoded.class);
            handle.load(decoded.class, decoded.attributes, row.version.clone(), row.document);
            trace!(txn = %self.txn_id, object = %reference, version = %row.version, "loaded");
            if let Some(hooks) = hooks {
                hooks.after_load(handle);
            }
        }
        self.detector.record_load(reference.clone(), Some(row.version));
        self.cache.mark_current(reference);
        Ok(())
    }
}

impl Drop for DataManager {
    fn drop(&mut self) {
        if self.backend_open {
            if let Err(e) = self.backend.rollback() {
                warn!(txn = %self.txn_id, error = %e, "backend rollback on drop failed");
            }
        }
    }
}

impl fmt::Debug for DataManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataManager")
            .field("txn", &self.txn_id)
            .field("status", &self.status)
            .field("cached", &self.cache.len())
            .field("pending", &self.state.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ClassInfo, FieldKind};
    use docjar_storage::{InMemoryStore, StorageError};

    fn registry() -> Arc<TypeRegistry> {
        let mut r = TypeRegistry::new();
        r.register_class(ClassInfo::new("Foo", "foo")).unwrap();
        r.register_class(ClassInfo::new("Bar", "bar").field("n", FieldKind::Int))
            .unwrap();
        Arc::new(r)
    }

    fn manager(store: &Arc<InMemoryStore>, config: Config) -> DataManager {
        DataManager::new(store.connect(), registry(), config)
    }

    #[test]
    fn insert_and_commit() {
        let store = InMemoryStore::shared();
        let mut dm = manager(&store, Config::default());
        let foo = ObjectHandle::new("Foo").with("name", "foo");
        let reference = dm.insert(&foo, Some(ObjectId::new("1"))).unwrap();
        assert_eq!(reference, ObjectRef::new("foo", "1"));
        dm.commit().unwrap();

        assert_eq!(dm.status(), TxnStatus::Committed);
        assert_eq!(foo.version(), Some(Version::counter(1)));
        assert_eq!(store.row_count("foo"), 1);
        assert_eq!(dm.stats().inserts, 1);
    }

    #[test]
    fn get_returns_cached_handle() {
        let store = InMemoryStore::shared();
        let mut dm = manager(&store, Config::default());
        dm.insert(&ObjectHandle::new("Foo"), Some(ObjectId::new("1")))
            .unwrap();
        dm.commit().unwrap();
        dm.reset().unwrap();

        let a = dm.get("foo", "1").unwrap().unwrap();
        let b = dm.get("foo", "1").unwrap().unwrap();
        assert!(a.ptr_eq(&b));
        assert!(dm.get("foo", "missing").unwrap().is_none());
        assert_eq!(dm.status(), TxnStatus::Active);
    }

    #[test]
    fn operations_after_commit_are_refused() {
        let store = InMemoryStore::shared();
        let mut dm = manager(&store, Config::default());
        dm.commit().unwrap();
        let err = dm.get("foo", "1").unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidState {
                status: TxnStatus::Committed,
                ..
            }
        ));
        assert!(dm.abort().is_err());
        assert!(dm.reset().is_ok());
        assert_eq!(dm.transaction_id(), TransactionId::new(2));
    }

    #[test]
    fn finish_requires_vote() {
        let store = InMemoryStore::shared();
        let mut dm = manager(&store, Config::default());
        dm.tpc_begin().unwrap();
        assert!(matches!(
            dm.tpc_finish(),
            Err(CoreError::InvalidState { .. })
        ));
        dm.tpc_vote().unwrap();
        dm.tpc_finish().unwrap();
    }

    #[test]
    fn abort_strips_assigned_ids() {
        let store = InMemoryStore::shared();
        let mut dm = manager(&store, Config::default());
        let foo = ObjectHandle::new("Foo");
        dm.insert(&foo, None).unwrap();
        dm.flush().unwrap();
        assert!(foo.is_persistent());

        dm.abort().unwrap();
        assert!(!foo.is_persistent());
        assert_eq!(store.row_count("foo"), 0);
        assert_eq!(dm.stats().transactions_aborted, 1);
        assert!(dm.abort().is_ok());
    }

    #[test]
    fn backend_error_aborts_and_is_verbatim() {
        let store = InMemoryStore::shared();
        let mut dm = manager(&store, Config::default());
        dm.insert(&ObjectHandle::new("Foo"), None).unwrap();
        store.set_unavailable(true);
        let err = dm.commit().unwrap_err();
        assert!(matches!(err, CoreError::Backend(StorageError::Unavailable(_))));
        assert_eq!(dm.status(), TxnStatus::Aborted);
    }

    #[test]
    fn remove_new_object_cancels_insert() {
        let store = InMemoryStore::shared();
        let mut dm = manager(&store, Config::default());
        let foo = ObjectHandle::new("Foo");
        dm.insert(&foo, None).unwrap();
        dm.remove(&foo).unwrap();
        assert!(!foo.is_persistent());
        dm.commit().unwrap();
        assert_eq!(store.row_count("foo"), 0);
    }

    #[test]
    fn remove_transient_fails() {
        let store = InMemoryStore::shared();
        let mut dm = manager(&store, Config::default());
        let err = dm.remove(&ObjectHandle::new("Foo")).unwrap_err();
        assert!(matches!(err, CoreError::NotPersisted { .. }));
        assert_eq!(dm.status(), TxnStatus::Active);
    }

    #[test]
    fn insert_twice_fails() {
        let store = InMemoryStore::shared();
        let mut dm = manager(&store, Config::default());
        let foo = ObjectHandle::new("Foo");
        dm.insert(&foo, None).unwrap();
        assert!(matches!(
            dm.insert(&foo, None),
            Err(CoreError::AlreadyPersisted { .. })
        ));
        assert!(matches!(
            dm.insert(&ObjectHandle::new("Nope"), None),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn declared_field_mismatch_aborts_flush() {
        let store = InMemoryStore::shared();
        let mut dm = manager(&store, Config::default());
        dm.insert(&ObjectHandle::new("Bar").with("n", "text"), None)
            .unwrap();
        assert!(matches!(
            dm.flush(),
            Err(CoreError::SchemaMismatch { .. })
        ));
        assert_eq!(dm.status(), TxnStatus::Aborted);
    }

    #[test]
    fn transaction_helper_commits_and_aborts() {
        let store = InMemoryStore::shared();
        let mut dm = manager(&store, Config::default());
        let reference = dm
            .transaction(|dm| dm.insert(&ObjectHandle::new("Foo"), None))
            .unwrap();
        assert_eq!(dm.status(), TxnStatus::Committed);
        assert!(store.row(&reference.table, &reference.id).is_some());

        let result: CoreResult<()> = dm.transaction(|dm| {
            dm.insert(&ObjectHandle::new("Foo"), None)?;
            Err(CoreError::invalid_operation("stop"))
        });
        assert!(result.is_err());
        assert_eq!(dm.status(), TxnStatus::Aborted);
        assert_eq!(store.row_count("foo"), 1);
    }

    #[test]
    fn debug_output() {
        let store = InMemoryStore::shared();
        let dm = manager(&store, Config::default());
        let text = format!("{dm:?}");
        assert!(text.contains("DataManager"));
        assert!(text.contains("Active"));
    }
}
