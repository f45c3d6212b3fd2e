//! Transactional map.

use crate::cell::VersionedCell;
use crate::context::CallContext;
use crate::error::{CoreError, CoreResult};
use crate::transaction::state::PendingChanges;
use crate::transaction::{Transaction, TransactionManager};
use crate::types::{ContainerId, SequenceNumber, TransactionId, Version};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use tracing::trace;

type Cells<K, V> = Arc<RwLock<HashMap<K, VersionedCell<V>>>>;

/// Pending writes (`None` is a tombstone) and observed versions for one map.
struct MapChanges<K, V> {
    cells: Cells<K, V>,
    writes: HashMap<K, Option<V>>,
    reads: HashMap<K, Version>,
}

impl<K, V> MapChanges<K, V> {
    fn new(cells: Cells<K, V>) -> Self {
        Self {
            cells,
            writes: HashMap::new(),
            reads: HashMap::new(),
        }
    }
}

impl<K, V> PendingChanges for MapChanges<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn write_count(&self) -> usize {
        self.writes.len()
    }

    fn is_current(&self) -> bool {
        let cells = self.cells.read();
        self.reads.iter().all(|(key, seen)| {
            cells.get(key).map_or(Version::INITIAL, VersionedCell::version) == *seen
        })
    }

    fn lock(&self, txid: TransactionId) -> Result<(), TransactionId> {
        let mut cells = self.cells.write();
        for key in self.writes.keys() {
            cells.entry(key.clone()).or_default().try_lock(txid)?;
        }
        Ok(())
    }

    fn apply(&mut self, txid: TransactionId, seq: SequenceNumber, retention: usize) {
        let mut cells = self.cells.write();
        for (key, value) in self.writes.drain() {
            let cell = cells.entry(key.clone()).or_default();
            cell.unlock(txid);
            if value.is_none() && cell.version() == Version::INITIAL {
                // Tombstone for a key that was never committed.
                cells.remove(&key);
                continue;
            }
            cell.publish(value, seq, retention);
        }
    }

    fn release(&mut self, txid: TransactionId) {
        let mut cells = self.cells.write();
        for key in self.writes.keys() {
            let orphan = match cells.get_mut(key) {
                Some(cell) => {
                    cell.unlock(txid);
                    cell.version() == Version::INITIAL && cell.locked_by().is_none()
                }
                None => false,
            };
            if orphan {
                cells.remove(key);
            }
        }
        self.writes.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A transactional mapping from key to value.
///
/// Writes are pending until the transaction commits; a key written and then
/// removed within one transaction reads as absent for the rest of it.
///
/// # Example
///
/// ```rust,ignore
/// let tm = Arc::new(TransactionManager::default());
/// let map = tm.new_map::<String, String>();
/// let mut ctx = CallContext::new();
///
/// tm.transactional(&mut ctx, |ctx| map.put(ctx, "k".into(), "v1".into()))?;
/// assert_eq!(map.get(&ctx, &"k".into())?, Some("v1".into()));
/// ```
pub struct TransactionalMap<K, V> {
    id: ContainerId,
    cells: Cells<K, V>,
    manager: Arc<TransactionManager>,
}

impl<K, V> Clone for TransactionalMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cells: Arc::clone(&self.cells),
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<K, V> TransactionalMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(id: ContainerId, manager: Arc<TransactionManager>) -> Self {
        Self {
            id,
            cells: Arc::new(RwLock::new(HashMap::new())),
            manager,
        }
    }

    /// Returns the container ID.
    #[must_use]
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Returns the committed version of `key` (zero if never committed).
    #[must_use]
    pub fn version(&self, key: &K) -> Version {
        self.cells
            .read()
            .get(key)
            .map_or(Version::INITIAL, VersionedCell::version)
    }

    /// Returns the value for `key`.
    ///
    /// Inside a transaction a pending write for `key` wins over the
    /// committed value.
    pub fn get(&self, ctx: &CallContext, key: &K) -> CoreResult<Option<V>> {
        self.manager.read_scope(ctx, |txn, snapshot| match txn {
            Some(txn) => self.read_in(txn, key),
            None => Ok(self.committed(key, snapshot).0),
        })
    }

    /// Returns true if `key` has a visible value.
    pub fn contains_key(&self, ctx: &CallContext, key: &K) -> CoreResult<bool> {
        Ok(self.get(ctx, key)?.is_some())
    }

    /// Records `value` for `key` as a pending write.
    pub fn put(&self, ctx: &CallContext, key: K, value: V) -> CoreResult<()> {
        self.manager.write_scope(ctx, |txn| {
            self.lock_for_write(txn.id(), &key)?;
            trace!(container = self.id.as_u32(), txid = txn.id().as_u64(), "map put");
            self.changes(txn)?.writes.insert(key, Some(value));
            Ok(())
        })
    }

    /// Records a pending removal of `key` and returns the value it replaces.
    pub fn remove(&self, ctx: &CallContext, key: &K) -> CoreResult<Option<V>> {
        self.manager.write_scope(ctx, |txn| {
            let previous = self.read_in(txn, key)?;
            self.lock_for_write(txn.id(), key)?;
            self.changes(txn)?.writes.insert(key.clone(), None);
            Ok(previous)
        })
    }

    /// Returns every key with a visible value, in no particular order.
    pub fn keys(&self, ctx: &CallContext) -> CoreResult<Vec<K>> {
        self.manager.read_scope(ctx, |txn, snapshot| {
            Ok(self.visible_keys(txn.as_deref(), snapshot))
        })
    }

    /// Returns the number of visible entries.
    pub fn len(&self, ctx: &CallContext) -> CoreResult<usize> {
        Ok(self.keys(ctx)?.len())
    }

    /// Returns true if the map has no visible entries.
    pub fn is_empty(&self, ctx: &CallContext) -> CoreResult<bool> {
        Ok(self.len(ctx)? == 0)
    }

    /// Records a pending removal of every visible key.
    pub fn clear(&self, ctx: &CallContext) -> CoreResult<()> {
        self.manager.write_scope(ctx, |txn| {
            let snapshot = txn.snapshot_seq();
            let keys = self.visible_keys(Some(&*txn), snapshot);
            self.lock_all_for_write(txn, &keys)?;
            let changes = self.changes(txn)?;
            for key in keys {
                changes.writes.insert(key, None);
            }
            Ok(())
        })
    }

    fn changes<'t>(&self, txn: &'t mut Transaction) -> CoreResult<&'t mut MapChanges<K, V>> {
        txn.changes_mut(self.id, || MapChanges::new(Arc::clone(&self.cells)))
    }

    fn committed(&self, key: &K, snapshot: SequenceNumber) -> (Option<V>, Version) {
        let cells = self.cells.read();
        match cells.get(key) {
            Some(cell) => {
                let (value, version) = cell.read_at(snapshot);
                (value.cloned(), version)
            }
            None => (None, Version::INITIAL),
        }
    }

    fn read_in(&self, txn: &mut Transaction, key: &K) -> CoreResult<Option<V>> {
        if let Some(pending) = txn
            .changes::<MapChanges<K, V>>(self.id)
            .and_then(|c| c.writes.get(key))
        {
            return Ok(pending.clone());
        }

        let (value, version) = self.committed(key, txn.snapshot_seq());
        if self.manager.tracks_reads() {
            self.changes(txn)?
                .reads
                .entry(key.clone())
                .or_insert(version);
        }
        Ok(value)
    }

    fn visible_keys(&self, txn: Option<&Transaction>, snapshot: SequenceNumber) -> Vec<K> {
        let pending = txn.and_then(|t| t.changes::<MapChanges<K, V>>(self.id));
        let mut keys: Vec<K> = {
            let cells = self.cells.read();
            cells
                .iter()
                .filter(|(key, cell)| {
                    cell.read_at(snapshot).0.is_some()
                        && !pending.is_some_and(|p| p.writes.contains_key(*key))
                })
                .map(|(key, _)| key.clone())
                .collect()
        };
        if let Some(pending) = pending {
            keys.extend(
                pending
                    .writes
                    .iter()
                    .filter(|(_, value)| value.is_some())
                    .map(|(key, _)| key.clone()),
            );
        }
        keys
    }

    /// Locks every key or none: on failure, locks taken here are released
    /// again. Keys already in the write set keep the lock they had.
    fn lock_all_for_write(&self, txn: &Transaction, keys: &[K]) -> CoreResult<()> {
        if !self.manager.locks_on_write() {
            return Ok(());
        }
        let txid = txn.id();
        let pending = txn.changes::<MapChanges<K, V>>(self.id);
        let mut cells = self.cells.write();
        for (taken, key) in keys.iter().enumerate() {
            let Err(holder) = cells.entry(key.clone()).or_default().try_lock(txid) else {
                continue;
            };
            for key in &keys[..taken] {
                if pending.is_some_and(|p| p.writes.contains_key(key)) {
                    continue;
                }
                if let Some(cell) = cells.get_mut(key) {
                    cell.unlock(txid);
                }
            }
            return Err(CoreError::write_lock_held(self.id, holder));
        }
        Ok(())
    }

    fn lock_for_write(&self, txid: TransactionId, key: &K) -> CoreResult<()> {
        if !self.manager.locks_on_write() {
            return Ok(());
        }
        self.cells
            .write()
            .entry(key.clone())
            .or_default()
            .try_lock(txid)
            .map_err(|holder| CoreError::write_lock_held(self.id, holder))
    }
}

impl<K, V> fmt::Debug for TransactionalMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalMap")
            .field("id", &self.id)
            .field("cells", &self.cells.read().len())
            .finish_non_exhaustive()
    }
}
