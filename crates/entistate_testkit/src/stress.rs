//! Stress tests for the transactional state engine.
//!
//! These runs drive many transactions from several threads and report
//! throughput alongside success and failure counts.

use entistate_core::{CallContext, CoreError, CoreResult, TransactionManager};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Conflicted attempts that were retried.
    pub retries: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, retries: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            retries,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Retries: {}", self.retries);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of distinct keys.
    pub key_count: usize,
    /// Attempts per operation before it counts as failed.
    pub max_attempts: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            key_count: 16,
            max_attempts: 64,
        }
    }
}

/// Runs `op` in a fresh transaction, retrying on retryable conflicts.
///
/// Returns the number of retries on success.
pub fn with_retries<T>(
    tm: &TransactionManager,
    max_attempts: usize,
    mut op: impl FnMut(&mut CallContext) -> CoreResult<T>,
) -> Result<(T, usize), CoreError> {
    let mut retries = 0;
    loop {
        let mut ctx = CallContext::new();
        match tm.transactional(&mut ctx, &mut op) {
            Ok(value) => return Ok((value, retries)),
            Err(err) if err.is_retryable() && retries + 1 < max_attempts => {
                retries += 1;
                thread::yield_now();
            }
            Err(err) => return Err(err),
        }
    }
}

/// Increments counters in a shared map from every thread.
///
/// Each operation reads a counter and writes it back plus one. Run with
/// [`ConflictPolicy::Optimistic`](entistate_core::ConflictPolicy::Optimistic)
/// to make every increment count; the final sum then equals the number of
/// successful operations.
pub fn stress_concurrent_counters(
    tm: &Arc<TransactionManager>,
    config: &StressConfig,
) -> (StressTestResult, u64) {
    let counters = tm.new_map::<usize, u64>();
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let retries = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let tm = Arc::clone(tm);
            let counters = counters.clone();
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let retries = Arc::clone(&retries);
            let config = config.clone();

            thread::spawn(move || {
                for i in 0..config.operations {
                    let key = (t * config.operations + i) % config.key_count;
                    let result = with_retries(&tm, config.max_attempts, |ctx| {
                        let current = counters.get(ctx, &key)?.unwrap_or(0);
                        counters.put(ctx, key, current + 1)
                    });
                    match result {
                        Ok(((), r)) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                            retries.fetch_add(r, Ordering::Relaxed);
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }
    let duration = start.elapsed();

    let ctx = CallContext::new();
    let total: u64 = (0..config.key_count)
        .map(|key| counters.get(&ctx, &key).ok().flatten().unwrap_or(0))
        .sum();

    let result = StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        retries.load(Ordering::Relaxed),
        duration,
    );
    (result, total)
}

/// Appends tagged entries to one vector from every thread.
///
/// Every third transaction fails after appending. Returns the committed
/// entries so callers can check that only successful appends landed and that
/// each thread's entries kept their order.
pub fn stress_concurrent_appends(
    tm: &Arc<TransactionManager>,
    config: &StressConfig,
) -> (StressTestResult, Vec<(usize, usize)>) {
    let log = tm.new_vector::<(usize, usize)>();
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let tm = Arc::clone(tm);
            let log = log.clone();
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let operations = config.operations;

            thread::spawn(move || {
                for i in 0..operations {
                    let mut ctx = CallContext::new();
                    let result = tm.transactional(&mut ctx, |ctx| {
                        log.append(ctx, (t, i))?;
                        if i % 3 == 2 {
                            return Err(CoreError::invalid_operation("intentional"));
                        }
                        Ok(())
                    });
                    match result {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }
    let duration = start.elapsed();

    let entries = log.to_vec(&CallContext::new()).unwrap_or_default();
    let result = StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        0,
        duration,
    );
    (result, entries)
}
