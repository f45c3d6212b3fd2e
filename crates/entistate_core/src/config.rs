//! Engine configuration.

/// How concurrent writes to the same cell are resolved.
///
/// A [`TransactionManager`](crate::TransactionManager) applies exactly one
/// policy to every transaction it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Commits never fail on contention; the later commit overwrites.
    #[default]
    LastCommitterWins,
    /// Commit fails with `CommitConflict` if any cell read by the transaction
    /// was committed by someone else after the first read.
    Optimistic,
    /// A write takes the cell's write lock immediately; a second writer fails
    /// with `WriteLockHeld` until the owner commits or rolls back.
    Exclusive,
}

/// Configuration for a transaction manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether writes outside a transaction run in a single-operation
    /// transaction instead of failing with `NoActiveTransaction`.
    pub auto_wrap: bool,

    /// Conflict resolution policy for concurrent writers.
    pub conflict_policy: ConflictPolicy,

    /// Number of superseded committed versions kept per cell for snapshot reads.
    pub version_retention: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_wrap: false,
            conflict_policy: ConflictPolicy::LastCommitterWins,
            version_retention: 8,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether writes outside a transaction are auto-wrapped.
    #[must_use]
    pub const fn auto_wrap(mut self, value: bool) -> Self {
        self.auto_wrap = value;
        self
    }

    /// Sets the conflict policy.
    #[must_use]
    pub const fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the per-cell version retention. Values below one are raised to one.
    #[must_use]
    pub const fn version_retention(mut self, versions: usize) -> Self {
        self.version_retention = if versions == 0 { 1 } else { versions };
        self
    }
}
