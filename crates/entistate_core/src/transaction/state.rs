//! Transaction state.

use crate::error::{CoreError, CoreResult};
use crate::types::{ContainerId, SequenceNumber, TransactionId};
use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

/// Typed write-set and read-set a transaction holds for one container.
///
/// Each container type supplies its own implementation; the transaction only
/// sees this erased interface when it commits or rolls back.
pub(crate) trait PendingChanges: Any + Send {
    /// Number of pending writes recorded.
    fn write_count(&self) -> usize;

    /// Returns false if a cell read by the transaction has a newer committed
    /// version than the one first observed.
    fn is_current(&self) -> bool;

    /// Takes the write lock of every written cell for `txid`.
    fn lock(&self, txid: TransactionId) -> Result<(), TransactionId>;

    /// Publishes every pending write under `seq` and releases the locks.
    fn apply(&mut self, txid: TransactionId, seq: SequenceNumber, retention: usize);

    /// Releases any lock held by `txid` without publishing.
    fn release(&mut self, txid: TransactionId);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// An active transaction.
///
/// Transactions provide atomicity and isolation. Changes made within a
/// transaction are not visible to other readers until commit. Reads see
/// committed state as of `snapshot_seq` plus the transaction's own writes.
pub struct Transaction {
    /// Transaction ID.
    id: TransactionId,
    /// Snapshot sequence number (reads see this point in time).
    snapshot_seq: SequenceNumber,
    /// Current state.
    state: TransactionState,
    /// Pending changes per touched container, ordered by container ID.
    changes: BTreeMap<ContainerId, Box<dyn PendingChanges>>,
    /// Why the transaction was aborted, once it is.
    abort_reason: Option<String>,
}

impl Transaction {
    /// Creates a new transaction.
    pub(crate) fn new(id: TransactionId, snapshot_seq: SequenceNumber) -> Self {
        Self {
            id,
            snapshot_seq,
            state: TransactionState::Active,
            changes: BTreeMap::new(),
            abort_reason: None,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the snapshot sequence number.
    #[must_use]
    pub fn snapshot_seq(&self) -> SequenceNumber {
        self.snapshot_seq
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Returns the total number of pending writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.changes.values().map(|c| c.write_count()).sum()
    }

    /// Returns the containers touched by this transaction.
    pub fn touched_containers(&self) -> impl Iterator<Item = ContainerId> + '_ {
        self.changes.keys().copied()
    }

    /// Returns the abort reason, if the transaction was aborted.
    #[must_use]
    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    /// Ensures the transaction is active.
    pub(crate) fn ensure_active(&self) -> CoreResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committed => Err(CoreError::invalid_operation(
                "transaction already committed",
            )),
            TransactionState::Aborted => Err(CoreError::transaction_aborted(
                self.id,
                self.abort_reason.clone().unwrap_or_default(),
            )),
        }
    }

    /// Returns the pending changes recorded for `container`.
    pub(crate) fn changes<C: PendingChanges>(&self, container: ContainerId) -> Option<&C> {
        self.changes
            .get(&container)
            .and_then(|c| c.as_any().downcast_ref::<C>())
    }

    /// Returns the pending changes for `container`, creating them on first touch.
    pub(crate) fn changes_mut<C: PendingChanges>(
        &mut self,
        container: ContainerId,
        init: impl FnOnce() -> C,
    ) -> CoreResult<&mut C> {
        self.ensure_active()?;
        self.changes
            .entry(container)
            .or_insert_with(|| Box::new(init()))
            .as_any_mut()
            .downcast_mut::<C>()
            .ok_or_else(|| {
                CoreError::invalid_operation(format!(
                    "container {container} registered with a different element type"
                ))
            })
    }

    /// Detaches every pending change, leaving the transaction empty.
    pub(crate) fn take_changes(&mut self) -> BTreeMap<ContainerId, Box<dyn PendingChanges>> {
        std::mem::take(&mut self.changes)
    }

    /// Marks the transaction as committed.
    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
    }

    /// Marks the transaction as aborted.
    pub(crate) fn mark_aborted(&mut self, reason: impl Into<String>) {
        self.state = TransactionState::Aborted;
        self.abort_reason = Some(reason.into());
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("snapshot_seq", &self.snapshot_seq)
            .field("state", &self.state)
            .field("containers", &self.changes.len())
            .field("writes", &self.write_count())
            .finish()
    }
}

/// Shared reference to a transaction attached to a calling context.
///
/// Nested calls on the same context clone the handle; they never create a
/// child transaction.
#[derive(Clone)]
pub struct TransactionHandle {
    id: TransactionId,
    inner: Arc<Mutex<Transaction>>,
}

impl TransactionHandle {
    pub(crate) fn new(txn: Transaction) -> Self {
        Self {
            id: txn.id(),
            inner: Arc::new(Mutex::new(txn)),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state()
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Returns the total number of pending writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.inner.lock().write_count()
    }

    /// Returns true if both handles refer to the same transaction.
    #[must_use]
    pub fn same_transaction(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Transaction> {
        self.inner.lock()
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransactionHandle").field(&self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        writes: usize,
    }

    impl PendingChanges for Counter {
        fn write_count(&self) -> usize {
            self.writes
        }

        fn is_current(&self) -> bool {
            true
        }

        fn lock(&self, _txid: TransactionId) -> Result<(), TransactionId> {
            Ok(())
        }

        fn apply(&mut self, _txid: TransactionId, _seq: SequenceNumber, _retention: usize) {}

        fn release(&mut self, _txid: TransactionId) {}

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn create_txn() -> Transaction {
        Transaction::new(TransactionId::new(1), SequenceNumber::new(0))
    }

    #[test]
    fn new_transaction_is_active() {
        let txn = create_txn();
        assert!(txn.is_active());
        assert_eq!(txn.state(), TransactionState::Active);
        assert_eq!(txn.write_count(), 0);
    }

    #[test]
    fn changes_are_created_once_per_container() {
        let mut txn = create_txn();
        let container = ContainerId::new(3);

        txn.changes_mut(container, Counter::default).unwrap().writes += 1;
        txn.changes_mut(container, Counter::default).unwrap().writes += 1;

        assert_eq!(txn.write_count(), 2);
        assert_eq!(txn.touched_containers().collect::<Vec<_>>(), vec![container]);
        assert_eq!(txn.changes::<Counter>(container).unwrap().writes, 2);
    }

    #[test]
    fn cannot_write_after_commit() {
        let mut txn = create_txn();
        txn.mark_committed();

        let result = txn.changes_mut(ContainerId::new(1), Counter::default);
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn cannot_write_after_abort() {
        let mut txn = create_txn();
        txn.mark_aborted("boom");

        let result = txn.changes_mut(ContainerId::new(1), Counter::default);
        assert!(matches!(result, Err(CoreError::TransactionAborted { .. })));
        assert_eq!(txn.abort_reason(), Some("boom"));
    }

    #[test]
    fn take_changes_empties_write_set() {
        let mut txn = create_txn();
        txn.changes_mut(ContainerId::new(1), Counter::default)
            .unwrap()
            .writes = 4;

        let taken = txn.take_changes();
        assert_eq!(taken.len(), 1);
        assert_eq!(txn.write_count(), 0);
    }

    #[test]
    fn handles_share_one_transaction() {
        let handle = TransactionHandle::new(create_txn());
        let nested = handle.clone();
        assert!(handle.same_transaction(&nested));

        nested.lock().mark_aborted("nested failure");
        assert_eq!(handle.state(), TransactionState::Aborted);
    }
}
