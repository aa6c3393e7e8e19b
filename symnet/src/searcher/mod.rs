// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! State scheduling.
//!
//! A searcher owns the pool of runnable states and decides which one the
//! engine steps next. Transmit-handler state changes are safe between a
//! selection and the next one; they never re-enter the searcher. Searchers
//! that support phony packets leave cache commits to quiescent points of
//! their own choosing and signal them through
//! [`Searcher::take_commit_request`].

mod cluster;
mod cooja;
mod lockstep;
mod strategy;

pub use cluster::ClusterSearcher;
pub use cooja::CoojaSearcher;
pub use lockstep::LockStepSearcher;
pub use strategy::{
    FifoStrategy, MangleStrategy, NullStrategy, RandomStrategy, RepeatStrategy, SearcherStrategy,
};

use symnet_shared::{Node, Time};

use crate::executor::StateId;
use crate::mapper::{ClusterId, StateMapper};

/// What a scheduler is allowed to ask the mapper about a state.
pub trait StateView {
    fn node_of(&self, state: StateId) -> Node;
    fn cluster_of(&self, state: StateId) -> Option<ClusterId>;
}

impl StateView for StateMapper {
    fn node_of(&self, state: StateId) -> Node {
        self.state_node(state)
    }

    fn cluster_of(&self, state: StateId) -> Option<ClusterId> {
        self.cluster_of(state)
    }
}

/// Kinds of wake-up events a discrete-event searcher distinguishes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    /// Pins a lower bound for subsequent wake-ups of the state.
    Boot,
    Normal,
}

pub trait Searcher {
    fn add(&mut self, states: &[StateId], view: &dyn StateView);
    fn remove(&mut self, states: &[StateId]);

    /// The next state to run, or `None` when the pool is exhausted.
    fn select_state(&mut self) -> Option<StateId>;

    fn is_empty(&self) -> bool;

    /// Whether queued transmissions may stay pending across selections.
    fn supports_phony_packets(&self) -> bool {
        false
    }

    /// The virtual time of a governed state.
    fn state_time(&self, _state: StateId) -> Time {
        0
    }

    /// Monotone lower bound on all future selections' virtual times.
    fn lower_bound(&self) -> Time {
        0
    }

    /// Block the state until the scheduler lifts the barrier.
    fn barrier(&mut self, _state: StateId) {}

    /// Inherit scheduling information across an engine fork.
    fn on_state_forked(&mut self, _parent: StateId, _child: StateId) {}

    /// A state's cluster changed; re-home it if the searcher partitions.
    fn notify_cluster_change(&mut self, _state: StateId, _view: &dyn StateView) {}

    /// True once when the searcher crossed a quiescent point since the
    /// last call; the runtime commits the packet cache then.
    fn take_commit_request(&mut self) -> bool {
        false
    }

    fn as_event_searcher(&mut self) -> Option<&mut dyn EventSearcher> {
        None
    }
}

/// Searchers driven by a calendar of timed events.
pub trait EventSearcher {
    fn schedule_state_at(&mut self, state: StateId, time: Time, kind: EventKind);

    /// Schedule relative to the state's current virtual time.
    fn schedule_state_in(&mut self, state: StateId, delta: Time, kind: EventKind);

    /// Take the state out of the calendar until it is scheduled again.
    fn yield_state(&mut self, state: StateId);
}
