//! # EntiState Core
//!
//! Transactional in-memory state for stateful units.
//!
//! This crate provides:
//! - Versioned cells with bounded history for snapshot reads
//! - Transactional map, vector and ref containers
//! - Transaction management with nested-call propagation and all-or-nothing commit
//! - Restart coordination with pre/post restart hooks
//!
//! ## Usage
//!
//! ```rust,ignore
//! use entistate_core::{CallContext, Config, TransactionManager};
//! use std::sync::Arc;
//!
//! let tm = Arc::new(TransactionManager::new(Config::default()));
//! let balances = tm.new_map::<String, u64>();
//! let mut ctx = CallContext::new();
//!
//! tm.transactional(&mut ctx, |ctx| balances.put(ctx, "alice".into(), 10))?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cell;
mod config;
mod container;
mod context;
mod error;
mod restart;
mod stats;
mod transaction;
mod types;

pub use cell::VersionedCell;
pub use config::{Config, ConflictPolicy};
pub use container::{TransactionalMap, TransactionalRef, TransactionalVector};
pub use context::{CallContext, Outcome};
pub use error::{CoreError, CoreResult};
pub use restart::{
    HookError, HookResult, RestartCoordinator, RestartReport, RestartState, Stateful,
};
pub use stats::{EngineStats, StatsSnapshot};
pub use transaction::{Transaction, TransactionHandle, TransactionManager, TransactionState};
pub use types::{ContainerId, SequenceNumber, TransactionId, Version};
