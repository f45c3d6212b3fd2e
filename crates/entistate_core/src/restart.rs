//! Restart coordination for stateful units.
//!
//! A unit is restarted by the supervising layer after a fault. The
//! coordinator runs the unit's pre-restart hook, rebuilds the unit, then runs
//! the post-restart hook. Hook failures and panics are logged and counted but
//! never stop the restart.
//!
//! Containers are not reset by a restart. A rebuilt unit that clones the
//! container handles of its predecessor sees exactly the committed state the
//! predecessor left behind.

use crate::transaction::TransactionManager;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Error returned by a restart hook.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a restart hook.
pub type HookResult = Result<(), HookError>;

/// Lifecycle hooks of a stateful unit.
pub trait Stateful {
    /// Runs before the unit is discarded; intended for capturing or
    /// flushing state.
    fn on_pre_restart(&mut self) -> HookResult {
        Ok(())
    }

    /// Runs after the unit is rebuilt; intended for re-initializing derived,
    /// non-transactional state.
    fn on_post_restart(&mut self) -> HookResult {
        Ok(())
    }
}

/// Lifecycle state of a supervised unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartState {
    /// The unit is serving calls.
    Running,
    /// The unit is between its pre-restart and post-restart hooks.
    Restarting,
}

/// Summary of one restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartReport {
    /// Restarts completed so far, including this one.
    pub restart_count: u64,
    /// Whether the pre-restart hook failed or panicked.
    pub pre_restart_failed: bool,
    /// Whether the post-restart hook failed or panicked.
    pub post_restart_failed: bool,
}

/// Owns one stateful unit and drives its `Running -> Restarting -> Running`
/// cycle.
pub struct RestartCoordinator<U> {
    unit: U,
    state: RestartState,
    restarts: u64,
    manager: Option<Arc<TransactionManager>>,
}

impl<U: Stateful> RestartCoordinator<U> {
    /// Wraps a running unit.
    pub fn new(unit: U) -> Self {
        Self {
            unit,
            state: RestartState::Running,
            restarts: 0,
            manager: None,
        }
    }

    /// Reports restarts and hook failures to `manager`'s statistics.
    #[must_use]
    pub fn with_manager(mut self, manager: Arc<TransactionManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Returns the unit.
    pub fn unit(&self) -> &U {
        &self.unit
    }

    /// Returns the unit mutably.
    pub fn unit_mut(&mut self) -> &mut U {
        &mut self.unit
    }

    /// Consumes the coordinator and returns the unit.
    pub fn into_inner(self) -> U {
        self.unit
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> RestartState {
        self.state
    }

    /// Returns the number of completed restarts.
    #[must_use]
    pub fn restart_count(&self) -> u64 {
        self.restarts
    }

    /// Restarts the unit.
    ///
    /// Runs the pre-restart hook on the current unit, replaces it with
    /// `rebuild(&old)`, then runs the post-restart hook on the new one. If
    /// `rebuild` itself panics, the old unit stays in place and the
    /// coordinator remains in [`RestartState::Restarting`].
    pub fn restart<F>(&mut self, reason: &str, rebuild: F) -> RestartReport
    where
        F: FnOnce(&U) -> U,
    {
        self.state = RestartState::Restarting;
        debug!(reason, restarts = self.restarts, "restarting unit");

        let unit = &mut self.unit;
        let pre_restart_failed = run_hook("pre_restart", || unit.on_pre_restart());

        self.unit = rebuild(&self.unit);

        let unit = &mut self.unit;
        let post_restart_failed = run_hook("post_restart", || unit.on_post_restart());

        self.restarts += 1;
        self.state = RestartState::Running;

        if let Some(manager) = &self.manager {
            manager.stats().record_restart();
            for failed in [pre_restart_failed, post_restart_failed] {
                if failed {
                    manager.stats().record_hook_failure();
                }
            }
        }
        debug!(restarts = self.restarts, "unit restarted");

        RestartReport {
            restart_count: self.restarts,
            pre_restart_failed,
            post_restart_failed,
        }
    }
}

/// Runs a hook, swallowing errors and panics. Returns true if it failed.
fn run_hook(name: &'static str, hook: impl FnOnce() -> HookResult) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => false,
        Ok(Err(err)) => {
            warn!(hook = name, error = %err, "restart hook failed");
            true
        }
        Err(payload) => {
            warn!(hook = name, panic = panic_message(&*payload), "restart hook panicked");
            true
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

impl<U> std::fmt::Debug for RestartCoordinator<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestartCoordinator")
            .field("state", &self.state)
            .field("restarts", &self.restarts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::CallContext;
    use crate::container::TransactionalRef;

    #[derive(Default)]
    struct Recorder {
        events: Vec<&'static str>,
        generation: u32,
        fail_pre: bool,
        panic_post: bool,
    }

    impl Stateful for Recorder {
        fn on_pre_restart(&mut self) -> HookResult {
            self.events.push("pre");
            if self.fail_pre {
                return Err("flush failed".into());
            }
            Ok(())
        }

        fn on_post_restart(&mut self) -> HookResult {
            self.events.push("post");
            if self.panic_post {
                panic!("post hook exploded");
            }
            Ok(())
        }
    }

    fn rebuild(old: &Recorder) -> Recorder {
        let mut events = old.events.clone();
        events.push("rebuild");
        Recorder {
            events,
            generation: old.generation + 1,
            fail_pre: old.fail_pre,
            panic_post: old.panic_post,
        }
    }

    #[test]
    fn hooks_run_in_order() {
        let mut coordinator = RestartCoordinator::new(Recorder::default());
        assert_eq!(coordinator.state(), RestartState::Running);

        let report = coordinator.restart("fault", rebuild);

        assert_eq!(coordinator.unit().events, vec!["pre", "rebuild", "post"]);
        assert_eq!(coordinator.unit().generation, 1);
        assert_eq!(coordinator.state(), RestartState::Running);
        assert_eq!(
            report,
            RestartReport {
                restart_count: 1,
                pre_restart_failed: false,
                post_restart_failed: false,
            }
        );
    }

    #[test]
    fn hook_failures_do_not_block_restart() {
        let tm = Arc::new(TransactionManager::new(Config::default()));
        let unit = Recorder {
            fail_pre: true,
            panic_post: true,
            ..Recorder::default()
        };
        let mut coordinator = RestartCoordinator::new(unit).with_manager(Arc::clone(&tm));

        let report = coordinator.restart("fault", rebuild);

        assert!(report.pre_restart_failed);
        assert!(report.post_restart_failed);
        assert_eq!(coordinator.unit().events, vec!["pre", "rebuild", "post"]);
        assert_eq!(coordinator.state(), RestartState::Running);
        assert_eq!(tm.stats().restarts(), 1);
        assert_eq!(tm.stats().hook_failures(), 2);
    }

    #[test]
    fn rebuild_panic_keeps_old_unit() {
        let mut coordinator = RestartCoordinator::new(Recorder::default());

        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            coordinator.restart("fault", |_| panic!("rebuild exploded"));
        }));

        assert!(caught.is_err());
        assert_eq!(coordinator.state(), RestartState::Restarting);
        assert_eq!(coordinator.unit().events, vec!["pre"]);
        assert_eq!(coordinator.unit().generation, 0);
        assert_eq!(coordinator.restart_count(), 0);

        let report = coordinator.restart("retry", rebuild);
        assert_eq!(report.restart_count, 1);
        assert_eq!(coordinator.state(), RestartState::Running);
        assert_eq!(coordinator.unit().events, vec!["pre", "pre", "rebuild", "post"]);
    }

    struct Holder {
        value: TransactionalRef<String>,
    }

    impl Stateful for Holder {}

    #[test]
    fn containers_survive_restart() {
        let tm = Arc::new(TransactionManager::new(Config::default()));
        let value = tm.new_ref::<String>();
        let mut ctx = CallContext::new();
        tm.transactional(&mut ctx, |ctx| value.swap(ctx, "kept".to_string()))
            .unwrap();

        let mut coordinator = RestartCoordinator::new(Holder { value });
        coordinator.restart("fault", |old| Holder {
            value: old.value.clone(),
        });
        coordinator.restart("fault", |old| Holder {
            value: old.value.clone(),
        });

        assert_eq!(
            coordinator.unit().value.get(&ctx).unwrap(),
            Some("kept".to_string())
        );
        assert_eq!(coordinator.restart_count(), 2);
    }
}
