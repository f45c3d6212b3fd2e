//! # EntiState Testkit
//!
//! Test utilities for EntiState.
//!
//! This crate provides:
//! - Stateful unit fixtures that call each other inside one transaction
//! - Property-based test generators using proptest
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use entistate_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_unit() {
//!     let tm = manager(Config::default());
//!     let unit = InMemStateful::new(&tm);
//!     let mut ctx = CallContext::new();
//!     unit.success(&mut ctx, "k", "v1").unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use entistate_core::{CallContext, Config, ConflictPolicy, CoreError, CoreResult};
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
