//! Transactional vector.

use crate::cell::VersionedCell;
use crate::context::CallContext;
use crate::error::{CoreError, CoreResult};
use crate::transaction::state::PendingChanges;
use crate::transaction::{Transaction, TransactionManager};
use crate::types::{ContainerId, SequenceNumber, TransactionId, Version};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Committed entries plus a length cell.
///
/// The length cell is versioned like any other cell, which gives snapshot
/// reads a consistent length and gives appenders a single cell to lock.
struct Entries<V> {
    cells: Vec<VersionedCell<V>>,
    length: VersionedCell<usize>,
}

impl<V> Entries<V> {
    fn len_at(&self, snapshot: SequenceNumber) -> (usize, Version) {
        let (len, version) = self.length.read_at(snapshot);
        (len.copied().unwrap_or(0), version)
    }
}

type Shared<V> = Arc<RwLock<Entries<V>>>;

/// Pending appends, in order, after whatever length is committed at commit
/// time, plus overwrites of committed entries.
struct VectorChanges<V> {
    entries: Shared<V>,
    appends: Vec<V>,
    updates: BTreeMap<usize, V>,
    reads: BTreeMap<usize, Version>,
    length_read: Option<Version>,
}

impl<V> VectorChanges<V> {
    fn new(entries: Shared<V>) -> Self {
        Self {
            entries,
            appends: Vec::new(),
            updates: BTreeMap::new(),
            reads: BTreeMap::new(),
            length_read: None,
        }
    }
}

impl<V> PendingChanges for VectorChanges<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn write_count(&self) -> usize {
        self.appends.len() + self.updates.len()
    }

    fn is_current(&self) -> bool {
        let entries = self.entries.read();
        let length_ok = self
            .length_read
            .map_or(true, |seen| entries.length.version() == seen);
        length_ok
            && self.reads.iter().all(|(&index, &seen)| {
                entries
                    .cells
                    .get(index)
                    .map_or(Version::INITIAL, VersionedCell::version)
                    == seen
            })
    }

    fn lock(&self, txid: TransactionId) -> Result<(), TransactionId> {
        let mut entries = self.entries.write();
        if !self.appends.is_empty() {
            entries.length.try_lock(txid)?;
        }
        for &index in self.updates.keys() {
            if let Some(cell) = entries.cells.get_mut(index) {
                cell.try_lock(txid)?;
            }
        }
        Ok(())
    }

    fn apply(&mut self, txid: TransactionId, seq: SequenceNumber, retention: usize) {
        let mut entries = self.entries.write();
        for (index, value) in std::mem::take(&mut self.updates) {
            if let Some(cell) = entries.cells.get_mut(index) {
                cell.unlock(txid);
                cell.publish(Some(value), seq, retention);
            }
        }

        entries.length.unlock(txid);
        if self.appends.is_empty() {
            return;
        }
        for value in self.appends.drain(..) {
            let mut cell = VersionedCell::new();
            cell.publish(Some(value), seq, retention);
            entries.cells.push(cell);
        }
        let len = entries.cells.len();
        entries.length.publish(Some(len), seq, retention);
    }

    fn release(&mut self, txid: TransactionId) {
        let mut entries = self.entries.write();
        entries.length.unlock(txid);
        for &index in self.updates.keys() {
            if let Some(cell) = entries.cells.get_mut(index) {
                cell.unlock(txid);
            }
        }
        self.appends.clear();
        self.updates.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A transactional, append-ordered sequence.
///
/// Appends within a transaction are kept as an ordered list and land after
/// the committed length at commit time, so concurrent appenders never collide
/// on an index.
pub struct TransactionalVector<V> {
    id: ContainerId,
    entries: Shared<V>,
    manager: Arc<TransactionManager>,
}

impl<V> Clone for TransactionalVector<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            entries: Arc::clone(&self.entries),
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<V> TransactionalVector<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(id: ContainerId, manager: Arc<TransactionManager>) -> Self {
        Self {
            id,
            entries: Arc::new(RwLock::new(Entries {
                cells: Vec::new(),
                length: VersionedCell::new(),
            })),
            manager,
        }
    }

    /// Returns the container ID.
    #[must_use]
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Returns the committed version of the vector's length.
    #[must_use]
    pub fn version(&self) -> Version {
        self.entries.read().length.version()
    }

    /// Records a pending append.
    pub fn append(&self, ctx: &CallContext, value: V) -> CoreResult<()> {
        self.manager.write_scope(ctx, |txn| {
            if self.manager.locks_on_write() {
                self.entries
                    .write()
                    .length
                    .try_lock(txn.id())
                    .map_err(|holder| CoreError::write_lock_held(self.id, holder))?;
            }
            trace!(container = self.id.as_u32(), txid = txn.id().as_u64(), "vector append");
            self.changes(txn)?.appends.push(value);
            Ok(())
        })
    }

    /// Records a pending overwrite of the entry at `index`.
    ///
    /// Fails with `IndexOutOfBounds` if `index` is not below [`size`](Self::size).
    pub fn update(&self, ctx: &CallContext, index: usize, value: V) -> CoreResult<()> {
        self.manager.write_scope(ctx, |txn| {
            let (base, _) = self.entries.read().len_at(txn.snapshot_seq());
            let pending = self.pending_appends(txn);
            if index >= base + pending {
                return Err(CoreError::IndexOutOfBounds {
                    index,
                    len: base + pending,
                });
            }

            if index >= base {
                self.changes(txn)?.appends[index - base] = value;
                return Ok(());
            }

            if self.manager.locks_on_write() {
                let mut entries = self.entries.write();
                if let Some(cell) = entries.cells.get_mut(index) {
                    cell.try_lock(txn.id())
                        .map_err(|holder| CoreError::write_lock_held(self.id, holder))?;
                }
            }
            self.changes(txn)?.updates.insert(index, value);
            Ok(())
        })
    }

    /// Returns the entry at `index`.
    ///
    /// Indices below the committed length read committed entries (or this
    /// transaction's overwrite); indices beyond it read this transaction's
    /// pending appends by offset.
    pub fn get(&self, ctx: &CallContext, index: usize) -> CoreResult<Option<V>> {
        self.manager.read_scope(ctx, |txn, snapshot| match txn {
            Some(txn) => self.read_in(txn, index),
            None => {
                let entries = self.entries.read();
                let (len, _) = entries.len_at(snapshot);
                if index >= len {
                    return Ok(None);
                }
                Ok(entries.cells[index].read_at(snapshot).0.cloned())
            }
        })
    }

    /// Returns the last entry: the last pending append if there is one,
    /// otherwise the last committed entry.
    pub fn last(&self, ctx: &CallContext) -> CoreResult<Option<V>> {
        self.manager.read_scope(ctx, |txn, snapshot| match txn {
            Some(txn) => {
                if let Some(value) = txn
                    .changes::<VectorChanges<V>>(self.id)
                    .and_then(|c| c.appends.last())
                {
                    return Ok(Some(value.clone()));
                }
                let base = self.read_len(txn)?;
                match base.checked_sub(1) {
                    Some(index) => self.read_in(txn, index),
                    None => Ok(None),
                }
            }
            None => {
                let entries = self.entries.read();
                let (len, _) = entries.len_at(snapshot);
                Ok(len
                    .checked_sub(1)
                    .and_then(|index| entries.cells[index].read_at(snapshot).0.cloned()))
            }
        })
    }

    /// Returns the committed length plus this transaction's pending appends.
    pub fn size(&self, ctx: &CallContext) -> CoreResult<usize> {
        self.manager.read_scope(ctx, |txn, snapshot| match txn {
            Some(txn) => Ok(self.read_len(txn)? + self.pending_appends(txn)),
            None => Ok(self.entries.read().len_at(snapshot).0),
        })
    }

    /// Returns true if [`size`](Self::size) is zero.
    pub fn is_empty(&self, ctx: &CallContext) -> CoreResult<bool> {
        Ok(self.size(ctx)? == 0)
    }

    /// Returns every visible entry in order.
    ///
    /// Every entry is read at one snapshot.
    pub fn to_vec(&self, ctx: &CallContext) -> CoreResult<Vec<V>> {
        self.manager.read_scope(ctx, |txn, snapshot| match txn {
            Some(txn) => {
                let len = self.read_len(txn)? + self.pending_appends(txn);
                (0..len)
                    .filter_map(|index| self.read_in(txn, index).transpose())
                    .collect()
            }
            None => {
                let entries = self.entries.read();
                let (len, _) = entries.len_at(snapshot);
                Ok(entries
                    .cells
                    .iter()
                    .take(len)
                    .filter_map(|cell| cell.read_at(snapshot).0.cloned())
                    .collect())
            }
        })
    }

    fn changes<'t>(&self, txn: &'t mut Transaction) -> CoreResult<&'t mut VectorChanges<V>> {
        txn.changes_mut(self.id, || VectorChanges::new(Arc::clone(&self.entries)))
    }

    fn pending_appends(&self, txn: &Transaction) -> usize {
        txn.changes::<VectorChanges<V>>(self.id)
            .map_or(0, |c| c.appends.len())
    }

    fn read_len(&self, txn: &mut Transaction) -> CoreResult<usize> {
        let (len, version) = self.entries.read().len_at(txn.snapshot_seq());
        if self.manager.tracks_reads() {
            self.changes(txn)?.length_read.get_or_insert(version);
        }
        Ok(len)
    }

    fn read_in(&self, txn: &mut Transaction, index: usize) -> CoreResult<Option<V>> {
        let base = self.read_len(txn)?;
        if index >= base {
            return Ok(txn
                .changes::<VectorChanges<V>>(self.id)
                .and_then(|c| c.appends.get(index - base))
                .cloned());
        }

        if let Some(value) = txn
            .changes::<VectorChanges<V>>(self.id)
            .and_then(|c| c.updates.get(&index))
        {
            return Ok(Some(value.clone()));
        }

        let (value, version) = {
            let entries = self.entries.read();
            let (value, version) = entries.cells[index].read_at(txn.snapshot_seq());
            (value.cloned(), version)
        };
        if self.manager.tracks_reads() {
            self.changes(txn)?.reads.entry(index).or_insert(version);
        }
        Ok(value)
    }
}

impl<V> fmt::Debug for TransactionalVector<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalVector")
            .field("id", &self.id)
            .field("len", &self.entries.read().cells.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConflictPolicy};
    use crate::context::Outcome;

    fn setup(config: Config) -> (Arc<TransactionManager>, TransactionalVector<&'static str>) {
        let tm = Arc::new(TransactionManager::new(config));
        let vector = tm.new_vector();
        (tm, vector)
    }

    #[test]
    fn append_order_survives_commit() {
        let (tm, vector) = setup(Config::default());
        let mut ctx = CallContext::new();

        tm.transactional(&mut ctx, |ctx| {
            vector.append(ctx, "a")?;
            vector.append(ctx, "b")
        })
        .unwrap();

        assert_eq!(vector.last(&ctx).unwrap(), Some("b"));
        assert_eq!(vector.get(&ctx, 0).unwrap(), Some("a"));
        assert_eq!(vector.get(&ctx, 1).unwrap(), Some("b"));
        assert_eq!(vector.get(&ctx, 2).unwrap(), None);
        assert_eq!(vector.size(&ctx).unwrap(), 2);
    }

    #[test]
    fn pending_appends_are_read_by_offset() {
        let (tm, vector) = setup(Config::default());
        let mut ctx = CallContext::new();
        tm.transactional(&mut ctx, |ctx| vector.append(ctx, "committed"))
            .unwrap();

        tm.begin(&mut ctx).unwrap();
        vector.append(&ctx, "pending").unwrap();
        assert_eq!(vector.size(&ctx).unwrap(), 2);
        assert_eq!(vector.get(&ctx, 1).unwrap(), Some("pending"));
        assert_eq!(vector.last(&ctx).unwrap(), Some("pending"));

        // Other observers still see the committed length.
        let outside = CallContext::new();
        assert_eq!(vector.size(&outside).unwrap(), 1);
        assert_eq!(vector.last(&outside).unwrap(), Some("committed"));

        tm.end(&mut ctx, Outcome::Failure).unwrap();
        assert_eq!(vector.to_vec(&ctx).unwrap(), vec!["committed"]);
    }

    #[test]
    fn concurrent_appenders_do_not_collide() {
        let (tm, vector) = setup(Config::default());
        let mut a = CallContext::new();
        let mut b = CallContext::new();
        tm.begin(&mut a).unwrap();
        tm.begin(&mut b).unwrap();

        vector.append(&a, "a1").unwrap();
        vector.append(&b, "b1").unwrap();
        vector.append(&a, "a2").unwrap();

        tm.end(&mut b, Outcome::Success).unwrap();
        tm.end(&mut a, Outcome::Success).unwrap();

        assert_eq!(vector.to_vec(&a).unwrap(), vec!["b1", "a1", "a2"]);
        assert_eq!(vector.version(), Version(2));
    }

    #[test]
    fn update_committed_and_pending_entries() {
        let (tm, vector) = setup(Config::default());
        let mut ctx = CallContext::new();
        tm.transactional(&mut ctx, |ctx| vector.append(ctx, "x"))
            .unwrap();

        tm.transactional(&mut ctx, |ctx| {
            vector.append(ctx, "y")?;
            vector.update(ctx, 0, "x2")?;
            vector.update(ctx, 1, "y2")?;
            assert_eq!(vector.get(ctx, 0)?, Some("x2"));
            assert_eq!(
                vector.update(ctx, 2, "z"),
                Err(CoreError::IndexOutOfBounds { index: 2, len: 2 })
            );
            Ok::<(), CoreError>(())
        })
        .unwrap();

        assert_eq!(vector.to_vec(&ctx).unwrap(), vec!["x2", "y2"]);
    }

    #[test]
    fn snapshot_hides_later_appends() {
        let (tm, vector) = setup(Config::default());
        let mut reader = CallContext::new();
        tm.begin(&mut reader).unwrap();

        let mut writer = CallContext::new();
        tm.transactional(&mut writer, |ctx| vector.append(ctx, "late"))
            .unwrap();

        assert_eq!(vector.size(&reader).unwrap(), 0);
        assert_eq!(vector.last(&reader).unwrap(), None);
        tm.end(&mut reader, Outcome::Success).unwrap();
    }

    #[test]
    fn optimistic_size_read_conflicts_with_append() {
        let (tm, vector) = setup(Config::new().conflict_policy(ConflictPolicy::Optimistic));
        let mut a = CallContext::new();
        let mut b = CallContext::new();
        tm.begin(&mut a).unwrap();
        tm.begin(&mut b).unwrap();

        assert_eq!(vector.size(&a).unwrap(), 0);
        vector.append(&a, "a").unwrap();
        vector.append(&b, "b").unwrap();

        tm.end(&mut b, Outcome::Success).unwrap();
        assert!(matches!(
            tm.end(&mut a, Outcome::Success),
            Err(CoreError::CommitConflict { .. })
        ));
        assert_eq!(vector.to_vec(&a).unwrap(), vec!["b"]);
    }

    #[test]
    fn exclusive_appenders_serialize() {
        let (tm, vector) = setup(Config::new().conflict_policy(ConflictPolicy::Exclusive));
        let mut a = CallContext::new();
        let mut b = CallContext::new();
        tm.begin(&mut a).unwrap();
        tm.begin(&mut b).unwrap();

        vector.append(&a, "a").unwrap();
        assert!(matches!(
            vector.append(&b, "b"),
            Err(CoreError::WriteLockHeld { .. })
        ));

        tm.end(&mut a, Outcome::Success).unwrap();
        vector.append(&b, "b").unwrap();
        tm.end(&mut b, Outcome::Success).unwrap();

        assert_eq!(vector.to_vec(&a).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn exclusive_update_of_committed_entry() {
        let (tm, vector) = setup(Config::new().conflict_policy(ConflictPolicy::Exclusive));
        let mut seed = CallContext::new();
        tm.transactional(&mut seed, |ctx| vector.append(ctx, "x"))
            .unwrap();

        let mut a = CallContext::new();
        let mut b = CallContext::new();
        let txa = tm.begin(&mut a).unwrap();
        tm.begin(&mut b).unwrap();

        vector.update(&a, 0, "a").unwrap();
        assert_eq!(
            vector.update(&b, 0, "b"),
            Err(CoreError::write_lock_held(vector.id(), txa.id()))
        );

        tm.end(&mut a, Outcome::Failure).unwrap();
        vector.update(&b, 0, "b").unwrap();
        tm.end(&mut b, Outcome::Success).unwrap();

        assert_eq!(vector.to_vec(&a).unwrap(), vec!["b"]);
        assert!(vector.entries.read().cells[0].locked_by().is_none());
    }

    #[test]
    fn to_vec_reads_once_at_one_snapshot() {
        let (tm, vector) = setup(Config::default());
        let mut ctx = CallContext::new();
        tm.transactional(&mut ctx, |ctx| {
            vector.append(ctx, "a")?;
            vector.append(ctx, "b")
        })
        .unwrap();

        let reads = tm.stats().reads();
        assert_eq!(vector.to_vec(&ctx).unwrap(), vec!["a", "b"]);
        assert_eq!(tm.stats().reads(), reads + 1);

        tm.begin(&mut ctx).unwrap();
        vector.update(&ctx, 0, "z").unwrap();
        vector.append(&ctx, "c").unwrap();
        let reads = tm.stats().reads();
        assert_eq!(vector.to_vec(&ctx).unwrap(), vec!["z", "b", "c"]);
        assert_eq!(tm.stats().reads(), reads + 1);
        assert_eq!(vector.to_vec(&CallContext::new()).unwrap(), vec!["a", "b"]);
        tm.end(&mut ctx, Outcome::Success).unwrap();
    }
}
