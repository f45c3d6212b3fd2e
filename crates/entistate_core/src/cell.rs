//! Versioned cells, the unit of transactional storage.

use crate::types::{SequenceNumber, TransactionId, Version};
use std::collections::VecDeque;
use tracing::debug;

/// A superseded committed value kept for snapshot reads.
#[derive(Debug, Clone)]
struct Superseded<V> {
    value: Option<V>,
    version: Version,
    seq: SequenceNumber,
}

/// A value plus its version tag and the transaction holding its write lock.
///
/// Committed state only changes through [`VersionedCell::publish`], which is
/// called while a commit holds the owning container's write guard. Older
/// committed values are kept in a bounded history so that transactions with
/// an earlier snapshot still read a consistent value.
#[derive(Debug, Clone)]
pub struct VersionedCell<V> {
    value: Option<V>,
    version: Version,
    committed_at: SequenceNumber,
    locked_by: Option<TransactionId>,
    history: VecDeque<Superseded<V>>,
}

impl<V> Default for VersionedCell<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> VersionedCell<V> {
    /// Creates a cell that has never been committed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            value: None,
            version: Version::INITIAL,
            committed_at: SequenceNumber::new(0),
            locked_by: None,
            history: VecDeque::new(),
        }
    }

    /// Returns the latest committed value.
    pub fn latest(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Returns the latest committed version.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the sequence of the commit that produced the latest value.
    #[must_use]
    pub fn committed_at(&self) -> SequenceNumber {
        self.committed_at
    }

    /// Returns the transaction holding the write lock, if any.
    #[must_use]
    pub fn locked_by(&self) -> Option<TransactionId> {
        self.locked_by
    }

    /// Returns the number of superseded versions currently retained.
    #[must_use]
    pub fn retained_versions(&self) -> usize {
        self.history.len()
    }

    /// Reads the value and version visible at `snapshot`.
    pub fn read_at(&self, snapshot: SequenceNumber) -> (Option<&V>, Version) {
        if self.committed_at <= snapshot {
            return (self.value.as_ref(), self.version);
        }

        if let Some(old) = self.history.iter().rev().find(|old| old.seq <= snapshot) {
            return (old.value.as_ref(), old.version);
        }

        let oldest = self.history.front().map_or(self.version, |old| old.version);
        if oldest <= Version(1) {
            // First commit happened after the snapshot.
            return (None, Version::INITIAL);
        }

        debug!(
            snapshot = snapshot.as_u64(),
            version = self.version.as_u64(),
            "snapshot version pruned, reading latest"
        );
        (self.value.as_ref(), self.version)
    }

    /// Takes the write lock for `txid`.
    ///
    /// Re-locking by the current owner succeeds. Returns the holder on failure.
    pub fn try_lock(&mut self, txid: TransactionId) -> Result<(), TransactionId> {
        match self.locked_by {
            Some(holder) if holder != txid => Err(holder),
            _ => {
                self.locked_by = Some(txid);
                Ok(())
            }
        }
    }

    /// Releases the write lock if `txid` owns it.
    pub fn unlock(&mut self, txid: TransactionId) {
        if self.locked_by == Some(txid) {
            self.locked_by = None;
        }
    }

    /// Publishes a committed value under `seq` and bumps the version.
    ///
    /// The replaced value moves into history, which is trimmed to `retention`.
    pub fn publish(&mut self, value: Option<V>, seq: SequenceNumber, retention: usize) {
        if self.version > Version::INITIAL {
            let old = Superseded {
                value: self.value.take(),
                version: self.version,
                seq: self.committed_at,
            };
            self.history.push_back(old);
            while self.history.len() > retention.max(1) {
                self.history.pop_front();
            }
        }
        self.value = value;
        self.version = self.version.bump();
        self.committed_at = seq;
    }
}
