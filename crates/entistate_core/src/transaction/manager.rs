//! Transaction manager.

use crate::config::{Config, ConflictPolicy};
use crate::container::{TransactionalMap, TransactionalRef, TransactionalVector};
use crate::context::{CallContext, Outcome};
use crate::error::{CoreError, CoreResult};
use crate::stats::EngineStats;
use crate::transaction::state::{Transaction, TransactionHandle, TransactionState};
use crate::types::{ContainerId, SequenceNumber, TransactionId};
use parking_lot::{Mutex, RwLock};
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Drives transaction boundaries for every container it creates.
///
/// The transaction manager provides:
/// - Boundary tracking per [`CallContext`]: the outermost transactional call
///   creates the transaction, nested calls reuse it
/// - Snapshot reads with read-your-writes
/// - Atomic commit: a commit publishes its sequence only after every pending
///   write is applied, so readers never observe a half-applied write set
/// - One [`ConflictPolicy`] applied to every transaction
///
/// Containers keep an `Arc` to their manager, so create the manager behind
/// an `Arc` and use [`new_map`](Self::new_map), [`new_vector`](Self::new_vector)
/// and [`new_ref`](Self::new_ref).
pub struct TransactionManager {
    /// Engine configuration.
    config: Config,
    /// Next transaction ID.
    next_txid: AtomicU64,
    /// Next sequence number.
    next_seq: AtomicU64,
    /// Current committed sequence (for snapshots).
    committed_seq: AtomicU64,
    /// Next container ID.
    next_container: AtomicU32,
    /// Commit lock - commits are applied one at a time.
    commit_lock: Mutex<()>,
    /// Active transactions.
    active_txns: RwLock<Vec<TransactionId>>,
    /// Counters.
    stats: EngineStats,
}

impl TransactionManager {
    /// Creates a new transaction manager.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            next_txid: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            committed_seq: AtomicU64::new(0),
            next_container: AtomicU32::new(1),
            commit_lock: Mutex::new(()),
            active_txns: RwLock::new(Vec::new()),
            stats: EngineStats::new(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the engine statistics.
    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Returns the current committed sequence number.
    #[must_use]
    pub fn committed_seq(&self) -> SequenceNumber {
        SequenceNumber::new(self.committed_seq.load(Ordering::SeqCst))
    }

    /// Returns the number of active transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active_txns.read().len()
    }

    /// Creates a new transactional map.
    pub fn new_map<K, V>(self: &Arc<Self>) -> TransactionalMap<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        TransactionalMap::new(self.next_container_id(), Arc::clone(self))
    }

    /// Creates a new transactional vector.
    pub fn new_vector<V>(self: &Arc<Self>) -> TransactionalVector<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        TransactionalVector::new(self.next_container_id(), Arc::clone(self))
    }

    /// Creates a new, unset transactional ref.
    pub fn new_ref<V>(self: &Arc<Self>) -> TransactionalRef<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        TransactionalRef::new(self.next_container_id(), Arc::clone(self))
    }

    /// Returns the transaction attached to `ctx`, attaching a fresh one if
    /// none exists.
    ///
    /// Repeated calls within one call chain return the same transaction. A
    /// transaction attached here is owned by the next outermost
    /// [`begin`](Self::begin) on the context.
    pub fn current(&self, ctx: &mut CallContext) -> TransactionHandle {
        ctx.detach_finished();
        if let Some(handle) = ctx.current_transaction() {
            return handle;
        }
        let handle = self.create();
        // Nothing is attached, so attaching cannot fail.
        let _ = ctx.attach_transaction(handle.clone());
        handle
    }

    /// Enters a transactional call on `ctx`.
    ///
    /// The outermost entry attaches a new transaction; nested entries reuse
    /// the attached one and only increase the nesting depth. Entering a
    /// transaction that a nested failure already aborted fails with
    /// `TransactionAborted`.
    pub fn begin(&self, ctx: &mut CallContext) -> CoreResult<TransactionHandle> {
        ctx.detach_finished();
        let handle = match ctx.current_transaction() {
            Some(handle) => {
                handle.lock().ensure_active()?;
                handle
            }
            None => {
                let handle = self.create();
                ctx.attach_transaction(handle.clone())?;
                handle
            }
        };
        ctx.enter();
        Ok(handle)
    }

    /// Leaves a transactional call on `ctx`.
    ///
    /// A failure at any depth rolls back the whole transaction. A success
    /// commits only when the outermost call returns; if the transaction was
    /// aborted by a nested failure the caller swallowed, the outermost
    /// success reports `TransactionAborted`.
    pub fn end(&self, ctx: &mut CallContext, outcome: Outcome) -> CoreResult<()> {
        let depth = ctx.exit()?;
        let handle = ctx
            .current_transaction()
            .ok_or_else(|| CoreError::invalid_operation("no transaction attached to context"))?;

        let result = match outcome {
            Outcome::Failure => {
                if handle.is_active() {
                    let reason = if depth == 0 {
                        "transactional call failed"
                    } else {
                        "nested transactional call failed"
                    };
                    self.abort_with(&handle, reason)
                } else {
                    Ok(())
                }
            }
            Outcome::Success if depth > 0 => Ok(()),
            Outcome::Success => {
                let txn = handle.lock();
                match txn.state() {
                    TransactionState::Active => {
                        drop(txn);
                        self.commit(&handle).map(|_| ())
                    }
                    TransactionState::Committed => Ok(()),
                    TransactionState::Aborted => txn.ensure_active(),
                }
            }
        };

        if depth == 0 {
            ctx.detach();
        }
        result
    }

    /// Runs `f` as a transactional call on `ctx`.
    ///
    /// This is the boundary dispatch wraps around a unit method: it begins,
    /// runs `f`, and ends with the call's outcome on every exit path. A panic
    /// inside `f` rolls back and then resumes unwinding. The original error
    /// of a failed call is returned unchanged.
    pub fn transactional<T, E, F>(&self, ctx: &mut CallContext, f: F) -> Result<T, E>
    where
        E: From<CoreError>,
        F: FnOnce(&mut CallContext) -> Result<T, E>,
    {
        self.begin(ctx)?;

        match panic::catch_unwind(AssertUnwindSafe(|| f(&mut *ctx))) {
            Ok(Ok(value)) => {
                self.end(ctx, Outcome::Success)?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(end_err) = self.end(ctx, Outcome::Failure) {
                    warn!(error = %end_err, "rollback after failed call did not complete");
                }
                Err(err)
            }
            Err(payload) => {
                if let Err(end_err) = self.end(ctx, Outcome::Failure) {
                    warn!(error = %end_err, "rollback after panicked call did not complete");
                }
                panic::resume_unwind(payload)
            }
        }
    }

    /// Commits a transaction.
    ///
    /// All pending writes are applied atomically, each touched cell's version
    /// is bumped by one, and the new sequence is published last. Under
    /// [`ConflictPolicy::Optimistic`] a stale read aborts the transaction with
    /// `CommitConflict` instead.
    pub fn commit(&self, handle: &TransactionHandle) -> CoreResult<SequenceNumber> {
        let _commit_guard = self.commit_lock.lock();
        let mut txn = handle.lock();

        if !txn.is_active() {
            return Err(CoreError::invalid_operation("transaction not active"));
        }

        let txid = txn.id();
        let mut changes = txn.take_changes();

        let stale = if self.config.conflict_policy == ConflictPolicy::Optimistic {
            changes
                .iter()
                .find(|(_, c)| !c.is_current())
                .map(|(id, _)| CoreError::commit_conflict(txid, *id))
        } else {
            None
        };
        let conflict = stale.or_else(|| {
            changes.iter().find_map(|(id, c)| {
                c.lock(txid)
                    .err()
                    .map(|holder| CoreError::write_lock_held(*id, holder))
            })
        });

        if let Some(err) = conflict {
            for c in changes.values_mut() {
                c.release(txid);
            }
            txn.mark_aborted(err.to_string());
            self.finish(txid);
            self.stats.record_conflict();
            self.stats.record_transaction_abort();
            debug!(txid = txid.as_u64(), error = %err, "commit rejected");
            return Err(err);
        }

        let sequence = SequenceNumber::new(self.next_seq.fetch_add(1, Ordering::SeqCst));
        let writes: usize = changes.values().map(|c| c.write_count()).sum();
        for c in changes.values_mut() {
            c.apply(txid, sequence, self.config.version_retention);
        }

        // Publishing the sequence makes the whole write set visible at once.
        self.committed_seq
            .store(sequence.as_u64(), Ordering::SeqCst);

        self.finish(txid);
        txn.mark_committed();
        self.stats.record_transaction_commit();
        debug!(
            txid = txid.as_u64(),
            seq = sequence.as_u64(),
            writes,
            "transaction committed"
        );

        Ok(sequence)
    }

    /// Rolls back a transaction.
    ///
    /// All pending writes are discarded and write locks released; no cell is
    /// touched.
    pub fn rollback(&self, handle: &TransactionHandle) -> CoreResult<()> {
        self.abort_with(handle, "rolled back")
    }

    /// Runs `op` against the transaction attached to `ctx`, or inside a
    /// single-operation transaction when auto-wrapping is enabled.
    pub(crate) fn write_scope<T>(
        &self,
        ctx: &CallContext,
        op: impl FnOnce(&mut Transaction) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let result = match ctx.live_transaction() {
            Some(handle) => {
                let mut txn = handle.lock();
                match txn.ensure_active() {
                    Ok(()) => op(&mut *txn),
                    Err(err) => Err(err),
                }
            }
            None if self.config.auto_wrap => {
                let mut auto = CallContext::new();
                self.transactional(&mut auto, |ctx| {
                    let handle = ctx
                        .transaction()
                        .ok_or(CoreError::NoActiveTransaction)?;
                    let mut txn = handle.lock();
                    op(&mut *txn)
                })
            }
            None => Err(CoreError::NoActiveTransaction),
        };

        match &result {
            Ok(_) => self.stats.record_write(),
            Err(CoreError::WriteLockHeld { .. }) => self.stats.record_conflict(),
            Err(_) => {}
        }
        result
    }

    /// Runs `op` with the attached transaction (if any) and the snapshot the
    /// read must observe.
    pub(crate) fn read_scope<T>(
        &self,
        ctx: &CallContext,
        op: impl FnOnce(Option<&mut Transaction>, SequenceNumber) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.stats.record_read();
        match ctx.live_transaction() {
            Some(handle) => {
                let mut txn = handle.lock();
                txn.ensure_active()?;
                let snapshot = txn.snapshot_seq();
                op(Some(&mut *txn), snapshot)
            }
            None => op(None, self.committed_seq()),
        }
    }

    /// Returns true if reads must be recorded for commit-time validation.
    pub(crate) fn tracks_reads(&self) -> bool {
        self.config.conflict_policy == ConflictPolicy::Optimistic
    }

    /// Returns true if writes take cell locks immediately.
    pub(crate) fn locks_on_write(&self) -> bool {
        self.config.conflict_policy == ConflictPolicy::Exclusive
    }

    fn next_container_id(&self) -> ContainerId {
        ContainerId::new(self.next_container.fetch_add(1, Ordering::SeqCst))
    }

    fn create(&self) -> TransactionHandle {
        let txid = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        let snapshot_seq = self.committed_seq();

        self.active_txns.write().push(txid);
        self.stats.record_transaction_start();
        debug!(
            txid = txid.as_u64(),
            snapshot = snapshot_seq.as_u64(),
            "transaction started"
        );

        TransactionHandle::new(Transaction::new(txid, snapshot_seq))
    }

    fn abort_with(&self, handle: &TransactionHandle, reason: &str) -> CoreResult<()> {
        let mut txn = handle.lock();
        if !txn.is_active() {
            return Err(CoreError::invalid_operation("transaction not active"));
        }

        let txid = txn.id();
        let mut changes = txn.take_changes();
        for c in changes.values_mut() {
            c.release(txid);
        }

        txn.mark_aborted(reason);
        self.finish(txid);
        self.stats.record_transaction_abort();
        debug!(txid = txid.as_u64(), reason, "transaction rolled back");

        Ok(())
    }

    fn finish(&self, txid: TransactionId) {
        self.active_txns.write().retain(|&id| id != txid);
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("committed_seq", &self.committed_seq())
            .field("active_count", &self.active_count())
            .field("conflict_policy", &self.config.conflict_policy)
            .finish_non_exhaustive()
    }
}
