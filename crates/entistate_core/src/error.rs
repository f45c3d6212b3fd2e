//! Error types for EntiState core.

use crate::types::{ContainerId, TransactionId};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in transactional state operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A write was attempted outside a transaction and auto-wrapping is disabled.
    #[error("no active transaction")]
    NoActiveTransaction,

    /// Operation attempted against a transaction that was already aborted.
    #[error("transaction {txid} aborted: {reason}")]
    TransactionAborted {
        /// The aborted transaction.
        txid: TransactionId,
        /// Reason for abort.
        reason: String,
    },

    /// A cell read by the transaction changed before it could commit.
    #[error("commit conflict for {txid} in container {container}")]
    CommitConflict {
        /// The transaction that failed to commit.
        txid: TransactionId,
        /// The container holding the conflicting cell.
        container: ContainerId,
    },

    /// A cell is write-locked by another active transaction.
    #[error("write lock on container {container} held by {holder}")]
    WriteLockHeld {
        /// The container holding the locked cell.
        container: ContainerId,
        /// The transaction owning the lock.
        holder: TransactionId,
    },

    /// Vector index outside the visible length.
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Visible length at the time of the request.
        len: usize,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a transaction aborted error.
    pub fn transaction_aborted(txid: TransactionId, reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            txid,
            reason: reason.into(),
        }
    }

    /// Creates a commit conflict error.
    pub fn commit_conflict(txid: TransactionId, container: ContainerId) -> Self {
        Self::CommitConflict { txid, container }
    }

    /// Creates a write lock error.
    pub fn write_lock_held(container: ContainerId, holder: TransactionId) -> Self {
        Self::WriteLockHeld { container, holder }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if retrying the whole transaction may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CommitConflict { .. } | Self::WriteLockHeld { .. }
        )
    }
}
