//! Engine statistics.
//!
//! Counters for monitoring transaction throughput, contention and restart
//! behavior.
//!
//! # Usage
//!
//! ```rust,ignore
//! let tm = TransactionManager::new(Config::default());
//!
//! // Run transactions...
//!
//! let stats = tm.stats().snapshot();
//! println!("Committed: {}", stats.transactions_committed);
//! println!("Aborted: {}", stats.transactions_aborted);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine statistics.
///
/// All counters are atomic and can be read while operations are in progress.
/// Values are monotonically increasing.
#[derive(Debug, Default)]
pub struct EngineStats {
    // Operation counters
    /// Total number of container reads.
    reads: AtomicU64,
    /// Total number of pending writes recorded.
    writes: AtomicU64,

    // Transaction counters
    /// Total number of transactions started.
    transactions_started: AtomicU64,
    /// Total number of transactions committed.
    transactions_committed: AtomicU64,
    /// Total number of transactions aborted.
    transactions_aborted: AtomicU64,
    /// Total number of commit conflicts and write-lock refusals.
    conflicts: AtomicU64,

    // Restart counters
    /// Total number of unit restarts.
    restarts: AtomicU64,
    /// Total number of restart hooks that failed or panicked.
    hook_failures: AtomicU64,
}

impl EngineStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a unit restart.
    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed restart hook.
    pub fn record_hook_failure(&self) {
        self.hook_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of container reads.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the total number of pending writes recorded.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions aborted.
    pub fn transactions_aborted(&self) -> u64 {
        self.transactions_aborted.load(Ordering::Relaxed)
    }

    /// Returns the total number of conflicts.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Returns the total number of restarts.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Returns the total number of failed restart hooks.
    pub fn hook_failures(&self) -> u64 {
        self.hook_failures.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads(),
            writes: self.writes(),
            transactions_started: self.transactions_started(),
            transactions_committed: self.transactions_committed(),
            transactions_aborted: self.transactions_aborted(),
            conflicts: self.conflicts(),
            restarts: self.restarts(),
            hook_failures: self.hook_failures(),
        }
    }
}

/// A point-in-time snapshot of engine statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Total number of container reads.
    pub reads: u64,
    /// Total number of pending writes recorded.
    pub writes: u64,
    /// Total number of transactions started.
    pub transactions_started: u64,
    /// Total number of transactions committed.
    pub transactions_committed: u64,
    /// Total number of transactions aborted.
    pub transactions_aborted: u64,
    /// Total number of conflicts.
    pub conflicts: u64,
    /// Total number of restarts.
    pub restarts: u64,
    /// Total number of failed restart hooks.
    pub hook_failures: u64,
}
