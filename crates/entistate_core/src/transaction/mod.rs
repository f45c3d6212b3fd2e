//! Transaction management.
//!
//! Transactions give the containers:
//! - **Atomicity**: all pending writes are published together or not at all
//! - **Isolation**: reads see a snapshot plus the transaction's own writes
//! - **Propagation**: nested calls on one calling context share a single
//!   transaction, and a failure at any depth aborts it

mod manager;
pub(crate) mod state;

pub use manager::TransactionManager;
pub use state::{Transaction, TransactionHandle, TransactionState};
