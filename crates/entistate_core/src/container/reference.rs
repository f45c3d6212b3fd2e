//! Transactional ref.

use crate::cell::VersionedCell;
use crate::context::CallContext;
use crate::error::{CoreError, CoreResult};
use crate::transaction::state::PendingChanges;
use crate::transaction::{Transaction, TransactionManager};
use crate::types::{ContainerId, SequenceNumber, TransactionId, Version};
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

type Shared<V> = Arc<RwLock<VersionedCell<V>>>;

struct RefChanges<V> {
    cell: Shared<V>,
    /// `Some(None)` is a pending clear.
    pending: Option<Option<V>>,
    read: Option<Version>,
}

impl<V> PendingChanges for RefChanges<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn write_count(&self) -> usize {
        usize::from(self.pending.is_some())
    }

    fn is_current(&self) -> bool {
        self.read
            .map_or(true, |seen| self.cell.read().version() == seen)
    }

    fn lock(&self, txid: TransactionId) -> Result<(), TransactionId> {
        if self.pending.is_some() {
            self.cell.write().try_lock(txid)?;
        }
        Ok(())
    }

    fn apply(&mut self, txid: TransactionId, seq: SequenceNumber, retention: usize) {
        let mut cell = self.cell.write();
        cell.unlock(txid);
        if let Some(value) = self.pending.take() {
            cell.publish(value, seq, retention);
        }
    }

    fn release(&mut self, txid: TransactionId) {
        self.cell.write().unlock(txid);
        self.pending = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A single transactional cell that may be unset.
pub struct TransactionalRef<V> {
    id: ContainerId,
    cell: Shared<V>,
    manager: Arc<TransactionManager>,
}

impl<V> Clone for TransactionalRef<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: Arc::clone(&self.cell),
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<V> TransactionalRef<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(id: ContainerId, manager: Arc<TransactionManager>) -> Self {
        Self {
            id,
            cell: Arc::new(RwLock::new(VersionedCell::new())),
            manager,
        }
    }

    /// Returns the container ID.
    #[must_use]
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Returns the committed version.
    #[must_use]
    pub fn version(&self) -> Version {
        self.cell.read().version()
    }

    /// Returns this transaction's pending value if it set one, otherwise the
    /// committed value.
    pub fn get(&self, ctx: &CallContext) -> CoreResult<Option<V>> {
        self.manager.read_scope(ctx, |txn, snapshot| match txn {
            Some(txn) => self.read_in(txn),
            None => Ok(self.cell.read().read_at(snapshot).0.cloned()),
        })
    }

    /// Returns true if a value is visible.
    pub fn is_defined(&self, ctx: &CallContext) -> CoreResult<bool> {
        Ok(self.get(ctx)?.is_some())
    }

    /// Returns the visible value or `default`.
    pub fn get_or_else(&self, ctx: &CallContext, default: V) -> CoreResult<V> {
        Ok(self.get(ctx)?.unwrap_or(default))
    }

    /// Records `value` as this transaction's pending value and returns the
    /// value it replaces.
    pub fn swap(&self, ctx: &CallContext, value: V) -> CoreResult<Option<V>> {
        self.set(ctx, Some(value))
    }

    /// Records a pending unset.
    pub fn clear(&self, ctx: &CallContext) -> CoreResult<()> {
        self.set(ctx, None).map(|_| ())
    }

    fn set(&self, ctx: &CallContext, value: Option<V>) -> CoreResult<Option<V>> {
        self.manager.write_scope(ctx, |txn| {
            let previous = self.read_in(txn)?;
            if self.manager.locks_on_write() {
                self.cell
                    .write()
                    .try_lock(txn.id())
                    .map_err(|holder| CoreError::write_lock_held(self.id, holder))?;
            }
            trace!(container = self.id.as_u32(), txid = txn.id().as_u64(), "ref set");
            self.changes(txn)?.pending = Some(value);
            Ok(previous)
        })
    }

    fn changes<'t>(&self, txn: &'t mut Transaction) -> CoreResult<&'t mut RefChanges<V>> {
        txn.changes_mut(self.id, || RefChanges {
            cell: Arc::clone(&self.cell),
            pending: None,
            read: None,
        })
    }

    fn read_in(&self, txn: &mut Transaction) -> CoreResult<Option<V>> {
        if let Some(pending) = txn
            .changes::<RefChanges<V>>(self.id)
            .and_then(|c| c.pending.as_ref())
        {
            return Ok(pending.clone());
        }

        let (value, version) = {
            let cell = self.cell.read();
            let (value, version) = cell.read_at(txn.snapshot_seq());
            (value.cloned(), version)
        };
        if self.manager.tracks_reads() {
            self.changes(txn)?.read.get_or_insert(version);
        }
        Ok(value)
    }
}

impl<V> fmt::Debug for TransactionalRef<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalRef")
            .field("id", &self.id)
            .field("version", &self.cell.read().version())
            .finish_non_exhaustive()
    }
}
