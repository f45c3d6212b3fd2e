//! Property-based test generators using proptest.
//!
//! Provides strategies for random operation sequences against a unit's
//! containers, plus a plain model that says what those sequences should
//! produce.

use crate::fixtures::UnitState;
use entistate_core::{CallContext, CoreResult};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// A single write against a [`UnitState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateOp {
    /// Map put.
    Put(String, String),
    /// Map remove.
    Remove(String),
    /// Map clear.
    ClearMap,
    /// Vector append.
    Append(String),
    /// Ref swap.
    Swap(String),
    /// Ref clear.
    ClearRef,
}

/// Strategy for short map keys, so operations collide often.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-d]").expect("Invalid regex")
}

/// Strategy for values.
pub fn value_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9]{1,8}").expect("Invalid regex")
}

/// Strategy for a single operation.
pub fn state_op_strategy() -> impl Strategy<Value = StateOp> {
    prop_oneof![
        4 => (key_strategy(), value_strategy()).prop_map(|(k, v)| StateOp::Put(k, v)),
        2 => key_strategy().prop_map(StateOp::Remove),
        1 => Just(StateOp::ClearMap),
        3 => value_strategy().prop_map(StateOp::Append),
        2 => value_strategy().prop_map(StateOp::Swap),
        1 => Just(StateOp::ClearRef),
    ]
}

/// Strategy for a sequence of operations.
pub fn state_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<StateOp>> {
    prop::collection::vec(state_op_strategy(), 0..max_len)
}

/// Plain reference model of a [`UnitState`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateModel {
    /// Map contents.
    pub map: BTreeMap<String, String>,
    /// Vector contents.
    pub vector: Vec<String>,
    /// Ref contents.
    pub reference: Option<String>,
}

impl StateModel {
    /// Applies `op` to the model.
    pub fn apply(&mut self, op: &StateOp) {
        match op {
            StateOp::Put(k, v) => {
                self.map.insert(k.clone(), v.clone());
            }
            StateOp::Remove(k) => {
                self.map.remove(k);
            }
            StateOp::ClearMap => self.map.clear(),
            StateOp::Append(v) => self.vector.push(v.clone()),
            StateOp::Swap(v) => self.reference = Some(v.clone()),
            StateOp::ClearRef => self.reference = None,
        }
    }

    /// Reads the visible state of `state` on `ctx` into a model.
    pub fn observe(state: &UnitState, ctx: &CallContext) -> CoreResult<Self> {
        let mut map = BTreeMap::new();
        for key in state.map.keys(ctx)? {
            if let Some(value) = state.map.get(ctx, &key)? {
                map.insert(key, value);
            }
        }
        Ok(Self {
            map,
            vector: state.vector.to_vec(ctx)?,
            reference: state.reference.get(ctx)?,
        })
    }
}

/// Applies `op` to the containers of `state` on `ctx`.
pub fn apply_op(state: &UnitState, ctx: &CallContext, op: &StateOp) -> CoreResult<()> {
    match op {
        StateOp::Put(k, v) => state.map.put(ctx, k.clone(), v.clone()),
        StateOp::Remove(k) => state.map.remove(ctx, k).map(|_| ()),
        StateOp::ClearMap => state.map.clear(ctx),
        StateOp::Append(v) => state.vector.append(ctx, v.clone()),
        StateOp::Swap(v) => state.reference.swap(ctx, v.clone()).map(|_| ()),
        StateOp::ClearRef => state.reference.clear(ctx),
    }
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to generate.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
    /// Maximum operations per generated sequence.
    pub max_ops: usize,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
            max_ops: 24,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 64,
            max_shrink_iters: 100,
            max_ops: 12,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
            max_ops: 64,
        }
    }

    /// Strategy for operation sequences bounded by `max_ops`.
    pub fn ops(&self) -> impl Strategy<Value = Vec<StateOp>> {
        state_ops_strategy(self.max_ops)
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
