//! Integration tests for transactional units calling each other.

use entistate_core::{
    CallContext, Config, ConflictPolicy, CoreError, Outcome, RestartCoordinator, RestartState,
};
use entistate_testkit::prelude::*;
use std::thread;

fn assert_state(unit: &InMemStateful, ctx: &mut CallContext, key: &str, expected: &str) {
    assert_eq!(
        unit.get_map_state(ctx, key).unwrap().as_deref(),
        Some(expected)
    );
    assert_eq!(unit.get_vector_state(ctx).unwrap().as_deref(), Some(expected));
    assert_eq!(unit.get_ref_state(ctx).unwrap().as_deref(), Some(expected));
}

#[test]
fn failed_call_keeps_previous_commit() {
    let tm = manager(Config::default());
    let unit = InMemStateful::new(&tm);
    let nested = InMemStatefulNested::new(&tm);
    let failer = InMemFailer::new(&tm);
    let mut ctx = CallContext::new();

    assert_eq!(unit.get_map_state(&mut ctx, "k").unwrap(), None);
    assert_eq!(unit.get_vector_state(&mut ctx).unwrap(), None);
    assert_eq!(unit.get_ref_state(&mut ctx).unwrap(), None);

    unit.success(&mut ctx, "k", "v1").unwrap();
    assert_state(&unit, &mut ctx, "k", "v1");

    let result = unit.failure_with_nested(&mut ctx, "k", "v2", &nested, &failer);
    assert!(matches!(result, Err(UnitError::Expected)));

    assert_state(&unit, &mut ctx, "k", "v1");
    assert_eq!(nested.state().map.get(&ctx, &"k".to_string()).unwrap(), None);
    assert!(!ctx.in_transaction());
    assert_eq!(tm.active_count(), 0);
}

#[test]
fn direct_failure_rolls_back_all_containers() {
    let tm = manager(Config::default());
    let unit = InMemStateful::new(&tm);
    let failer = InMemFailer::new(&tm);
    let mut ctx = CallContext::new();

    unit.success(&mut ctx, "k", "v1").unwrap();
    assert!(unit.failure(&mut ctx, "k", "v2", &failer).is_err());

    assert_state(&unit, &mut ctx, "k", "v1");
    assert_eq!(unit.state().vector.size(&ctx).unwrap(), 1);
}

#[test]
fn nested_success_commits_both_units_once() {
    let tm = manager(Config::default());
    let unit = InMemStateful::new(&tm);
    let nested = InMemStatefulNested::new(&tm);
    let mut ctx = CallContext::new();

    unit.success_with_nested(&mut ctx, "k", "v1", &nested).unwrap();

    assert_state(&unit, &mut ctx, "k", "v1");
    assert_eq!(
        nested.state().reference.get(&ctx).unwrap().as_deref(),
        Some("v1")
    );
    // Only the outermost boundary commits.
    assert_eq!(tm.stats().transactions_committed(), 1 + 3);
    assert_eq!(tm.stats().transactions_started(), 1 + 3);
}

#[test]
fn self_reentrant_call_joins_the_transaction() {
    let tm = manager(Config::default());
    let unit = InMemStateful::new(&tm);
    let mut ctx = CallContext::new();

    unit.self_nested_write(&mut ctx, "k", "v1").unwrap();

    assert_eq!(unit.get_map_state(&mut ctx, "k").unwrap().as_deref(), Some("v1"));
    assert_eq!(tm.stats().transactions_started(), 2);
}

#[test]
fn swallowed_nested_failure_still_aborts() {
    let tm = manager(Config::default());
    let unit = InMemStateful::new(&tm);
    let failer = InMemFailer::new(&tm);
    let mut ctx = CallContext::new();

    let result: UnitResult<()> = tm.transactional(&mut ctx, |ctx| {
        unit.set_map_state(ctx, "k", "v1")?;
        let _ = failer.fail(ctx);
        Ok(())
    });

    assert!(matches!(
        result,
        Err(UnitError::Core(CoreError::TransactionAborted { .. }))
    ));
    assert_eq!(unit.get_map_state(&mut ctx, "k").unwrap(), None);
}

#[test]
fn uncommitted_writes_are_invisible_to_other_contexts() {
    let tm = manager(Config::default());
    let unit = InMemStateful::new(&tm);
    let mut writer = CallContext::new();
    let mut reader = CallContext::new();

    unit.success(&mut writer, "k", "v1").unwrap();

    tm.begin(&mut writer).unwrap();
    unit.set_map_state(&mut writer, "k", "v2").unwrap();
    assert_eq!(unit.get_map_state(&mut writer, "k").unwrap().as_deref(), Some("v2"));
    assert_eq!(unit.get_map_state(&mut reader, "k").unwrap().as_deref(), Some("v1"));
    tm.end(&mut writer, Outcome::Success).unwrap();

    assert_eq!(unit.get_map_state(&mut reader, "k").unwrap().as_deref(), Some("v2"));
}

#[test]
fn transaction_started_before_commit_keeps_its_snapshot() {
    let tm = manager(Config::default());
    let unit = InMemStateful::new(&tm);
    let mut t1 = CallContext::new();
    let mut t2 = CallContext::new();

    unit.success(&mut t1, "k", "v1").unwrap();

    tm.begin(&mut t2).unwrap();
    assert_eq!(unit.get_ref_state(&mut t2).unwrap().as_deref(), Some("v1"));

    unit.success(&mut t1, "k", "v2").unwrap();

    assert_state(&unit, &mut t2, "k", "v1");
    tm.end(&mut t2, Outcome::Success).unwrap();

    let mut t3 = CallContext::new();
    assert_state(&unit, &mut t3, "k", "v2");
}

#[test]
fn vector_appends_keep_call_order() {
    let tm = manager(Config::default());
    let unit = InMemStateful::new(&tm);
    let mut ctx = CallContext::new();

    tm.transactional(&mut ctx, |ctx| {
        unit.set_vector_state(ctx, "a")?;
        unit.set_vector_state(ctx, "b")
    })
    .unwrap();

    let vector = &unit.state().vector;
    assert_eq!(vector.last(&ctx).unwrap().as_deref(), Some("b"));
    assert_eq!(vector.get(&ctx, 0).unwrap().as_deref(), Some("a"));
    assert_eq!(vector.get(&ctx, 1).unwrap().as_deref(), Some("b"));
}

#[test]
fn restart_without_writes_leaves_containers_unchanged() {
    let tm = manager(Config::default());
    let unit = InMemStateful::new(&tm);
    let mut ctx = CallContext::new();
    unit.success(&mut ctx, "k", "v1").unwrap();
    let versions = (
        unit.state().map.version(&"k".to_string()),
        unit.state().vector.version(),
        unit.state().reference.version(),
    );

    let mut coordinator = RestartCoordinator::new(unit).with_manager(tm.clone());
    let report = coordinator.restart("fault", InMemStateful::rebuild);

    assert!(!report.pre_restart_failed);
    assert!(!report.post_restart_failed);
    assert_eq!(coordinator.state(), RestartState::Running);

    let unit = coordinator.unit();
    assert_eq!(*unit.hooks().lock(), vec!["pre_restart", "post_restart"]);
    assert_state(unit, &mut ctx, "k", "v1");
    assert_eq!(
        (
            unit.state().map.version(&"k".to_string()),
            unit.state().vector.version(),
            unit.state().reference.version(),
        ),
        versions
    );
    assert_eq!(tm.stats().restarts(), 1);
}

#[test]
fn propagated_context_joins_caller_transaction() {
    let tm = manager(Config::default());
    let unit = InMemStateful::new(&tm);
    let nested = InMemStatefulNested::new(&tm);
    let failer = InMemFailer::new(&tm);
    let mut ctx = CallContext::new();

    // A callee on another thread writes into the caller's transaction.
    tm.begin(&mut ctx).unwrap();
    unit.set_map_state(&mut ctx, "k", "v1").unwrap();
    let mut remote = ctx.propagate();
    thread::scope(|s| {
        s.spawn(|| nested.success(&mut remote, "k", "v1").unwrap());
    });
    assert_eq!(nested.state().map.get(&CallContext::new(), &"k".to_string()).unwrap(), None);
    tm.end(&mut ctx, Outcome::Success).unwrap();
    assert_eq!(
        nested.state().map.get(&ctx, &"k".to_string()).unwrap().as_deref(),
        Some("v1")
    );

    // A remote failure aborts the caller's transaction too.
    tm.begin(&mut ctx).unwrap();
    unit.set_map_state(&mut ctx, "k", "v2").unwrap();
    let mut remote = ctx.propagate();
    let remote_result = thread::scope(|s| {
        s.spawn(|| nested.failure(&mut remote, "k", "v2", &failer))
            .join()
            .unwrap()
    });
    assert!(remote_result.is_err());
    assert!(matches!(
        tm.end(&mut ctx, Outcome::Success),
        Err(CoreError::TransactionAborted { .. })
    ));
    assert_eq!(unit.get_map_state(&mut ctx, "k").unwrap().as_deref(), Some("v1"));
    assert_eq!(
        nested.state().map.get(&ctx, &"k".to_string()).unwrap().as_deref(),
        Some("v1")
    );
}

#[test]
fn writes_outside_a_transaction() {
    let strict = manager(Config::default());
    let map = strict.new_map::<String, String>();
    let ctx = CallContext::new();
    assert_eq!(
        map.put(&ctx, "k".into(), "v".into()),
        Err(CoreError::NoActiveTransaction)
    );

    let wrapping = manager(Config::new().auto_wrap(true));
    let map = wrapping.new_map::<String, String>();
    map.put(&ctx, "k".into(), "v".into()).unwrap();
    assert_eq!(map.get(&ctx, &"k".into()).unwrap().as_deref(), Some("v"));
}

#[test]
fn exclusive_policy_rejects_second_writer() {
    let tm = manager(Config::new().conflict_policy(ConflictPolicy::Exclusive));
    let unit = InMemStateful::new(&tm);
    let mut a = CallContext::new();
    let mut b = CallContext::new();

    tm.begin(&mut a).unwrap();
    unit.set_ref_state(&mut a, "a").unwrap();

    let err = unit.set_ref_state(&mut b, "b").unwrap_err();
    assert!(matches!(err, UnitError::Core(CoreError::WriteLockHeld { .. })));

    tm.end(&mut a, Outcome::Success).unwrap();
    unit.set_ref_state(&mut b, "b").unwrap();
    assert_eq!(unit.get_ref_state(&mut b).unwrap().as_deref(), Some("b"));
}
