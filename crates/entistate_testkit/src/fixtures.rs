//! Stateful unit fixtures.
//!
//! Units hold a map, a vector and a ref, and expose transactional methods the
//! way a dispatch layer would call them: every method takes the caller's
//! [`CallContext`] and runs inside [`TransactionManager::transactional`].

use entistate_core::{
    CallContext, Config, CoreError, HookResult, Stateful, TransactionManager, TransactionalMap,
    TransactionalRef, TransactionalVector,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Installs a `RUST_LOG`-filtered subscriber that writes through the test
/// harness. Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Creates a shared manager with `config`.
pub fn manager(config: Config) -> Arc<TransactionManager> {
    init_test_tracing();
    Arc::new(TransactionManager::new(config))
}

/// Errors raised by fixture units.
#[derive(Debug, Error)]
pub enum UnitError {
    /// Raised on purpose by [`InMemFailer`].
    #[error("expected failure")]
    Expected,

    /// Raised by the transactional state engine.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for fixture unit methods.
pub type UnitResult<T> = Result<T, UnitError>;

/// Shared record of restart hook invocations.
pub type HookLog = Arc<Mutex<Vec<&'static str>>>;

/// The three containers every fixture unit owns.
#[derive(Clone, Debug)]
pub struct UnitState {
    /// Keyed state.
    pub map: TransactionalMap<String, String>,
    /// Append-ordered state.
    pub vector: TransactionalVector<String>,
    /// Single-value state.
    pub reference: TransactionalRef<String>,
}

impl UnitState {
    /// Creates empty containers on `tm`.
    pub fn new(tm: &Arc<TransactionManager>) -> Self {
        Self {
            map: tm.new_map(),
            vector: tm.new_vector(),
            reference: tm.new_ref(),
        }
    }

    fn record(&self, ctx: &CallContext, key: &str, msg: &str) -> UnitResult<()> {
        self.map.put(ctx, key.to_string(), msg.to_string())?;
        self.vector.append(ctx, msg.to_string())?;
        self.reference.swap(ctx, msg.to_string())?;
        Ok(())
    }
}

/// A unit whose only transactional method always fails.
#[derive(Clone, Debug)]
pub struct InMemFailer {
    tm: Arc<TransactionManager>,
}

impl InMemFailer {
    /// Creates a failer on `tm`.
    pub fn new(tm: &Arc<TransactionManager>) -> Self {
        Self { tm: Arc::clone(tm) }
    }

    /// Fails inside its own transactional boundary.
    pub fn fail(&self, ctx: &mut CallContext) -> UnitResult<()> {
        self.tm.transactional(ctx, |_| Err(UnitError::Expected))
    }
}

/// A second stateful unit, called from [`InMemStateful`] on the same context.
#[derive(Clone, Debug)]
pub struct InMemStatefulNested {
    tm: Arc<TransactionManager>,
    state: UnitState,
}

impl InMemStatefulNested {
    /// Creates a nested unit with empty containers.
    pub fn new(tm: &Arc<TransactionManager>) -> Self {
        Self {
            tm: Arc::clone(tm),
            state: UnitState::new(tm),
        }
    }

    /// Returns the unit's containers.
    pub fn state(&self) -> &UnitState {
        &self.state
    }

    /// Records `msg` in all three containers.
    pub fn success(&self, ctx: &mut CallContext, key: &str, msg: &str) -> UnitResult<()> {
        self.tm
            .transactional(ctx, |ctx| self.state.record(ctx, key, msg))
    }

    /// Records `msg` in all three containers, then calls `failer`.
    pub fn failure(
        &self,
        ctx: &mut CallContext,
        key: &str,
        msg: &str,
        failer: &InMemFailer,
    ) -> UnitResult<String> {
        self.tm.transactional(ctx, |ctx| {
            self.state.record(ctx, key, msg)?;
            failer.fail(ctx)?;
            Ok(msg.to_string())
        })
    }
}

/// The primary stateful unit.
#[derive(Clone, Debug)]
pub struct InMemStateful {
    tm: Arc<TransactionManager>,
    state: UnitState,
    hooks: HookLog,
}

impl InMemStateful {
    /// Creates a unit with empty containers.
    pub fn new(tm: &Arc<TransactionManager>) -> Self {
        Self {
            tm: Arc::clone(tm),
            state: UnitState::new(tm),
            hooks: HookLog::default(),
        }
    }

    /// Builds the replacement instance used on restart.
    ///
    /// The replacement shares the predecessor's containers and hook log.
    pub fn rebuild(&self) -> Self {
        self.clone()
    }

    /// Returns the unit's containers.
    pub fn state(&self) -> &UnitState {
        &self.state
    }

    /// Returns the restart hook log.
    pub fn hooks(&self) -> &HookLog {
        &self.hooks
    }

    /// Reads the map entry for `key`.
    pub fn get_map_state(&self, ctx: &mut CallContext, key: &str) -> UnitResult<Option<String>> {
        self.tm
            .transactional(ctx, |ctx| Ok(self.state.map.get(ctx, &key.to_string())?))
    }

    /// Reads the last vector entry.
    pub fn get_vector_state(&self, ctx: &mut CallContext) -> UnitResult<Option<String>> {
        self.tm
            .transactional(ctx, |ctx| Ok(self.state.vector.last(ctx)?))
    }

    /// Reads the ref.
    pub fn get_ref_state(&self, ctx: &mut CallContext) -> UnitResult<Option<String>> {
        self.tm
            .transactional(ctx, |ctx| Ok(self.state.reference.get(ctx)?))
    }

    /// Writes the map entry for `key`.
    pub fn set_map_state(&self, ctx: &mut CallContext, key: &str, msg: &str) -> UnitResult<()> {
        self.tm.transactional(ctx, |ctx| {
            self.state.map.put(ctx, key.to_string(), msg.to_string())?;
            Ok(())
        })
    }

    /// Appends to the vector.
    pub fn set_vector_state(&self, ctx: &mut CallContext, msg: &str) -> UnitResult<()> {
        self.tm.transactional(ctx, |ctx| {
            self.state.vector.append(ctx, msg.to_string())?;
            Ok(())
        })
    }

    /// Swaps the ref.
    pub fn set_ref_state(&self, ctx: &mut CallContext, msg: &str) -> UnitResult<()> {
        self.tm.transactional(ctx, |ctx| {
            self.state.reference.swap(ctx, msg.to_string())?;
            Ok(())
        })
    }

    /// Records `msg` in all three containers.
    pub fn success(&self, ctx: &mut CallContext, key: &str, msg: &str) -> UnitResult<()> {
        self.tm
            .transactional(ctx, |ctx| self.state.record(ctx, key, msg))
    }

    /// Records `msg` here and in `nested`, sharing one transaction.
    pub fn success_with_nested(
        &self,
        ctx: &mut CallContext,
        key: &str,
        msg: &str,
        nested: &InMemStatefulNested,
    ) -> UnitResult<()> {
        self.tm.transactional(ctx, |ctx| {
            self.state.record(ctx, key, msg)?;
            nested.success(ctx, key, msg)
        })
    }

    /// Records `msg`, then calls `failer`.
    pub fn failure(
        &self,
        ctx: &mut CallContext,
        key: &str,
        msg: &str,
        failer: &InMemFailer,
    ) -> UnitResult<String> {
        self.tm.transactional(ctx, |ctx| {
            self.state.record(ctx, key, msg)?;
            failer.fail(ctx)?;
            Ok(msg.to_string())
        })
    }

    /// Records `msg`, then calls `nested`, which records and calls `failer`.
    pub fn failure_with_nested(
        &self,
        ctx: &mut CallContext,
        key: &str,
        msg: &str,
        nested: &InMemStatefulNested,
        failer: &InMemFailer,
    ) -> UnitResult<String> {
        self.tm.transactional(ctx, |ctx| {
            self.state.record(ctx, key, msg)?;
            nested.failure(ctx, key, msg, failer)
        })
    }

    /// Calls one of its own transactional methods from inside another.
    pub fn self_nested_write(&self, ctx: &mut CallContext, key: &str, msg: &str) -> UnitResult<()> {
        self.tm
            .transactional(ctx, |ctx| self.set_map_state(ctx, key, msg))
    }
}

impl Stateful for InMemStateful {
    fn on_pre_restart(&mut self) -> HookResult {
        info!("pre restart");
        self.hooks.lock().push("pre_restart");
        Ok(())
    }

    fn on_post_restart(&mut self) -> HookResult {
        info!("post restart");
        self.hooks.lock().push("post_restart");
        Ok(())
    }
}
