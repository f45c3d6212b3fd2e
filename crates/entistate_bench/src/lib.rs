//! Shared helpers for EntiState benchmarks.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use entistate_core::{Config, TransactionManager};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;

/// Creates a manager with `config`.
pub fn manager(config: Config) -> Arc<TransactionManager> {
    Arc::new(TransactionManager::new(config))
}

/// Generates `count` random alphanumeric keys of length `len`.
pub fn random_keys(count: usize, len: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect()
        })
        .collect()
}
