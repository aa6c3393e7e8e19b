// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Facade over the underlying symbolic executor.
//!
//! The distributed layer consumes a small surface of the engine: a state
//! arena with a fork primitive, per-state constraint managers and address
//! spaces, and a solver seam for validity queries. Everything here is
//! deliberately engine-shaped so that the layer above never needs to know
//! whether a real SMT-backed executor or the structural test substitute is
//! underneath.

mod constraints;
mod memory;

use std::collections::HashSet;
use std::fmt;

pub use constraints::{ConstraintManager, Solver, StructuralSolver, Validity};
pub use memory::{AddressSpace, MemId, MemoryManager, MemoryObject, ObjectState};
use symnet_shared::expr::ExprRef;
use symnet_shared::Node;

use crate::txdata::ConfigurationData;

/// Handle to an engine state. Stable for the lifetime of the state.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(pub u32);

impl fmt::Debug for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// A symbolic object recorded for test-case generation.
#[derive(Debug, Clone)]
pub struct SymbolicObject {
    pub array: symnet_shared::expr::ArrayRef,
    pub mo: Option<MemId>,
}

/// One engine-level symbolic execution state, extended with the records the
/// distributed layer attaches on first need.
#[derive(Debug)]
pub struct State {
    pub constraints: ConstraintManager,
    pub address_space: AddressSpace,
    /// Names of symbolic objects visible on this state; used to detect
    /// collisions when distributed symbols are installed.
    pub array_names: HashSet<String>,
    /// Symbolic objects captured into test records at termination.
    pub symbolics: Vec<SymbolicObject>,
    pub completed_transmissions: usize,
    pub completed_pull_requests: usize,
    /// Distributed configuration record: symbol registry, constraint
    /// dependency graph and the pending transmission, if any.
    pub config: Option<ConfigurationData>,
}

impl State {
    fn new() -> Self {
        State {
            constraints: ConstraintManager::new(),
            address_space: AddressSpace::default(),
            array_names: HashSet::new(),
            symbolics: Vec::new(),
            completed_transmissions: 0,
            completed_pull_requests: 0,
            config: None,
        }
    }

    fn fork_for(&self, child: StateId) -> Self {
        State {
            constraints: self.constraints.clone(),
            address_space: self.address_space.clone(),
            array_names: self.array_names.clone(),
            symbolics: self.symbolics.clone(),
            completed_transmissions: self.completed_transmissions,
            completed_pull_requests: self.completed_pull_requests,
            config: self.config.as_ref().map(|c| c.fork_for(child)),
        }
    }

    /// The configuration record, attaching one anchored at `node` if absent.
    pub fn configure(&mut self, me: StateId, node: Node) -> &mut ConfigurationData {
        if self.config.is_none() {
            self.config = Some(ConfigurationData::new(me, node));
        }
        self.config.as_mut().expect("just attached")
    }
}

/// The engine facade: state arena, global memory objects and the solver.
pub struct Executor {
    states: Vec<Option<State>>,
    pub memory: MemoryManager,
    solver: Box<dyn Solver>,
    /// `(parent, child)` pairs created by fork since the scheduler last
    /// drained them.
    added: Vec<(StateId, StateId)>,
}

impl Executor {
    pub fn new(solver: Box<dyn Solver>) -> Self {
        Executor {
            states: Vec::new(),
            memory: MemoryManager::new(),
            solver,
            added: Vec::new(),
        }
    }

    pub fn with_structural_solver() -> Self {
        Self::new(Box::new(StructuralSolver))
    }

    pub fn create_state(&mut self) -> StateId {
        let id = StateId(self.states.len() as u32);
        self.states.push(Some(State::new()));
        id
    }

    pub fn state(&self, id: StateId) -> &State {
        self.states[id.0 as usize]
            .as_ref()
            .expect("stale state handle")
    }

    pub fn state_mut(&mut self, id: StateId) -> &mut State {
        self.states[id.0 as usize]
            .as_mut()
            .expect("stale state handle")
    }

    pub fn is_alive(&self, id: StateId) -> bool {
        self.states
            .get(id.0 as usize)
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Simultaneous mutable access to two distinct states.
    pub fn state_pair_mut(&mut self, a: StateId, b: StateId) -> (&mut State, &mut State) {
        assert_ne!(a, b, "state_pair_mut with aliasing handles");
        let (ai, bi) = (a.0 as usize, b.0 as usize);
        if ai < bi {
            let (lo, hi) = self.states.split_at_mut(bi);
            (
                lo[ai].as_mut().expect("stale state handle"),
                hi[0].as_mut().expect("stale state handle"),
            )
        } else {
            let (lo, hi) = self.states.split_at_mut(ai);
            (
                hi[0].as_mut().expect("stale state handle"),
                lo[bi].as_mut().expect("stale state handle"),
            )
        }
    }

    /// The engine fork primitive. The new state is an exact copy, including
    /// attached records; it is queued for scheduler pickup.
    pub fn fork(&mut self, parent: StateId) -> StateId {
        let child = StateId(self.states.len() as u32);
        let copy = self.state(parent).fork_for(child);
        self.states.push(Some(copy));
        self.added.push((parent, child));
        log::trace!("forked {parent} -> {child}");
        child
    }

    /// Destroy a state. All attached records go with it.
    pub fn remove_state(&mut self, id: StateId) {
        self.states[id.0 as usize] = None;
        self.added.retain(|(_, c)| *c != id);
    }

    /// Drain the `(parent, child)` pairs forked since the last call.
    pub fn take_added(&mut self) -> Vec<(StateId, StateId)> {
        std::mem::take(&mut self.added)
    }

    pub fn evaluate(&self, state: StateId, expr: &ExprRef) -> Validity {
        self.solver.evaluate(&self.state(state).constraints, expr)
    }

    pub fn evaluate_against(&self, cm: &ConstraintManager, expr: &ExprRef) -> Validity {
        self.solver.evaluate(cm, expr)
    }

    pub fn live_states(&self) -> impl Iterator<Item = StateId> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| StateId(i as u32))
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field(
                "states",
                &self.states.iter().filter(|s| s.is_some()).count(),
            )
            .field("added", &self.added)
            .finish()
    }
}
