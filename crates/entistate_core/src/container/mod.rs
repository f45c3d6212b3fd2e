//! Transactional containers.
//!
//! Every container is a cheap, cloneable handle onto cells it exclusively
//! owns. Operations take the caller's [`CallContext`](crate::CallContext):
//! - Inside a transaction, reads see the transaction's snapshot plus its own
//!   pending writes, and writes are recorded in the transaction's write-set
//! - Outside a transaction, reads see the latest committed state, and writes
//!   fail with `NoActiveTransaction` unless auto-wrapping is enabled

mod map;
mod reference;
mod vector;

pub use map::TransactionalMap;
pub use reference::TransactionalRef;
pub use vector::TransactionalVector;
